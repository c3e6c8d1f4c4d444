//! Dispatch pipeline and axum server wiring.
//!
//! Every request, whether it arrives over HTTP or as one item of a batch, goes through
//! [`Gateway::handle_request`]:
//! - pre-processing: body-size limit and query parsing
//! - route match against the routing table
//! - handler invocation
//! - the standard error handler ([`GatewayError::into_response`])
//! - post-processing: default `content-type`
//!
//! The axum app is a single fallback handler that builds a [`RequestContext`] and calls the
//! pipeline.

use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::Request,
    response::IntoResponse,
    Router,
};
use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt as _};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use serde::Serialize;
use tracing::Instrument as _;
use uuid::Uuid;

use crate::{
    batching,
    binder::{BoundMetric, MetricSource},
    cache::ResponseCache,
    config::GatewayConfig,
    error::GatewayError,
    registry::{MetricDescriptor, MetricRegistry},
    routes::{RouteMatch, RouteTable},
    table::MetricValue,
    transform::{transform, TransformOptions},
};

/// Path prefix shared by every gateway route.
pub const API_VERSION: &str = "api/unstable";

#[derive(Debug, Clone)]
/// HTTP response produced by the pipeline.
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    /// A response with no `content-type`; post-processing fills in the default.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from(body.into()),
        }
    }

    pub fn json(status: StatusCode, body: impl Into<String>) -> Self {
        let mut resp = Self::text(status, body);
        resp.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        resp
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> axum::response::Response {
        let mut res = axum::response::Response::new(Body::from(self.body));
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

#[derive(Debug, Clone)]
/// Everything the pipeline knows about one request. Owned and never shared between requests.
pub struct RequestContext {
    /// Gateway-generated request identifier.
    pub id: String,
    pub method: Method,
    pub path: String,
    pub raw_query_string: String,
    /// Parsed from `raw_query_string` during pre-processing.
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RequestContext {
    /// `uri` is a path with an optional `?query` suffix.
    pub fn new(method: Method, uri: &str, body: Bytes) -> Self {
        let (path, raw_query_string) = uri.split_once('?').unwrap_or((uri, ""));
        Self {
            id: format!("r-{}", Uuid::new_v4()),
            method,
            path: path.to_string(),
            raw_query_string: raw_query_string.to_string(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// The request URL (path + query string), used as the cache key.
    pub fn url(&self) -> String {
        if self.raw_query_string.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.raw_query_string)
        }
    }
}

/// Handlers bound in the routing table.
#[derive(Debug)]
pub(crate) enum Handler {
    Status,
    Batch,
    Metric(Arc<BoundMetric>),
}

/// Collects routes before the gateway starts serving.
pub struct GatewayBuilder {
    routes: RouteTable<Handler>,
    cache: Arc<ResponseCache>,
    registry: Arc<MetricRegistry>,
    max_body_bytes: usize,
    max_resample_buckets: usize,
}

impl GatewayBuilder {
    /// A builder with the status and batch routes installed.
    pub fn new(cache: Arc<ResponseCache>, registry: Arc<MetricRegistry>) -> Self {
        let mut builder = Self {
            routes: RouteTable::new(),
            cache,
            registry,
            max_body_bytes: GatewayConfig::default().max_body_bytes,
            max_resample_buckets: GatewayConfig::default().max_resample_buckets,
        };
        builder.install_builtin_routes();
        builder
    }

    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self::new(
            Arc::new(ResponseCache::new(cfg.cache_ttl())),
            Arc::new(MetricRegistry::new(cfg.metadata_path.clone())),
        )
        .max_body_bytes(cfg.max_body_bytes)
        .max_resample_buckets(cfg.max_resample_buckets)
    }

    pub fn max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn max_resample_buckets(mut self, max_resample_buckets: usize) -> Self {
        self.max_resample_buckets = max_resample_buckets;
        self
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Let `source` bind all of its endpoints.
    pub fn add_source(&mut self, source: &dyn MetricSource) -> anyhow::Result<()> {
        source.create_routes(self)
    }

    pub(crate) fn route(
        &mut self,
        template: &str,
        method: Method,
        handler: Handler,
    ) -> anyhow::Result<()> {
        self.routes.insert(template, method, handler)
    }

    fn install_builtin_routes(&mut self) {
        let builtin = [
            (format!("/{API_VERSION}/"), Method::GET, Handler::Status),
            (format!("/{API_VERSION}/status"), Method::GET, Handler::Status),
            (format!("/{API_VERSION}/batch"), Method::GET, Handler::Batch),
            (format!("/{API_VERSION}/batch"), Method::POST, Handler::Batch),
        ];
        for (template, method, handler) in builtin {
            // Fixed, well-formed templates on an empty table.
            if let Err(err) = self.route(&template, method, handler) {
                tracing::error!(event = "builtin_route_failed", route = %template, error = %err);
            }
        }
    }

    /// Freeze the routing table. The response cache is cleared once here, at startup.
    pub fn build(self) -> Arc<Gateway> {
        self.cache.clear();
        tracing::info!(
            event = "gateway_built",
            routes = self.routes.len(),
            metrics = self.registry.len(),
            cache_ttl_secs = self.cache.ttl().as_secs(),
            "gateway ready"
        );
        Arc::new(Gateway {
            routes: self.routes,
            cache: self.cache,
            registry: self.registry,
            max_body_bytes: self.max_body_bytes,
            max_resample_buckets: self.max_resample_buckets,
        })
    }
}

/// The request-dispatch pipeline and its process-wide state.
pub struct Gateway {
    routes: RouteTable<Handler>,
    cache: Arc<ResponseCache>,
    registry: Arc<MetricRegistry>,
    max_body_bytes: usize,
    max_resample_buckets: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    status: &'static str,
    available_metrics: Vec<MetricDescriptor>,
}

impl Gateway {
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn max_resample_buckets(&self) -> usize {
        self.max_resample_buckets
    }

    /// Run one request through the full pipeline. Never fails: errors and panics in a handler
    /// become responses.
    pub fn handle_request(&self, mut ctx: RequestContext) -> BoxFuture<'_, GatewayResponse> {
        let span = tracing::debug_span!(
            "request",
            id = %ctx.id,
            method = %ctx.method,
            path = %ctx.path
        );
        async move {
            let result = match self.preprocess(&mut ctx) {
                Ok(()) => AssertUnwindSafe(self.dispatch(&ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(GatewayError::Panic(panic_message(payload.as_ref())))
                    }),
                Err(err) => Err(err),
            };
            let resp = result.unwrap_or_else(|err| {
                if err.status().is_server_error() {
                    tracing::warn!(event = "request_failed", error = %err, "handler failed");
                } else {
                    tracing::debug!(event = "request_rejected", error = %err);
                }
                err.into_response()
            });
            postprocess(resp)
        }
        .instrument(span)
        .boxed()
    }

    fn preprocess(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        if ctx.body.len() > self.max_body_bytes {
            return Err(GatewayError::PayloadTooLarge);
        }
        ctx.query = url::form_urlencoded::parse(ctx.raw_query_string.as_bytes())
            .into_owned()
            .collect();
        Ok(())
    }

    async fn dispatch(&self, ctx: &RequestContext) -> Result<GatewayResponse, GatewayError> {
        match self.routes.match_request(&ctx.method, &ctx.path) {
            RouteMatch::NotFound => Err(GatewayError::NotFound),
            RouteMatch::MethodNotAllowed { allowed } => {
                Err(GatewayError::MethodNotAllowed { allowed })
            }
            RouteMatch::Matched {
                handler, params, ..
            } => match handler {
                Handler::Status => self.status(),
                Handler::Batch => batching::handle_batch(self, ctx).await,
                Handler::Metric(bound) => bound.handle(ctx, params, self).await,
            },
        }
    }

    fn status(&self) -> Result<GatewayResponse, GatewayError> {
        let report = StatusReport {
            status: "OK",
            available_metrics: self.registry.list(),
        };
        let body = transform(
            MetricValue::from_serialize(&report),
            &TransformOptions::default(),
        )?;
        Ok(GatewayResponse::json(StatusCode::OK, body.into_string()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn postprocess(mut resp: GatewayResponse) -> GatewayResponse {
    if !resp.headers.contains_key(header::CONTENT_TYPE) {
        resp.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    resp
}

pub fn build_app(gateway: Arc<Gateway>) -> Router {
    Router::new().fallback(handle_any).with_state(gateway)
}

/// A gateway configured from `cfg` with the routes of every source in `sources` bound.
pub fn build_gateway(
    cfg: &GatewayConfig,
    sources: &[&dyn MetricSource],
) -> anyhow::Result<Arc<Gateway>> {
    let mut builder = GatewayBuilder::from_config(cfg);
    for source in sources {
        builder.add_source(*source)?;
    }
    Ok(builder.build())
}

/// Build a gateway over `sources` and serve it until ctrl-c.
pub async fn serve(cfg: &GatewayConfig, sources: &[&dyn MetricSource]) -> anyhow::Result<()> {
    run(cfg, build_gateway(cfg, sources)?).await
}

pub async fn run(cfg: &GatewayConfig, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let sweeper = tokio::spawn(sweep_cache(Arc::clone(&gateway)));
    let app = build_app(gateway);
    let listener = tokio::net::TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
    tracing::info!(
        event = "server_started",
        addr = %listener.local_addr()?,
        "listening"
    );
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    sweeper.abort();
    served?;
    Ok(())
}

/// Evict expired cache entries once per TTL.
async fn sweep_cache(gateway: Arc<Gateway>) {
    let period = gateway.cache().ttl().max(std::time::Duration::from_secs(1));
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        gateway.cache().evict_expired();
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!(event = "shutdown", "ctrl-c received");
    }
}

/// Catch-all handler: every route is matched by the pipeline, not by axum.
async fn handle_any(
    State(gateway): State<Arc<Gateway>>,
    req: Request<Body>,
) -> axum::response::Response {
    let (parts, body) = req.into_parts();

    let body = match to_bytes(body, gateway.max_body_bytes).await {
        Ok(b) => b,
        Err(_) => return postprocess(GatewayError::PayloadTooLarge.into_response()).into_response(),
    };

    let uri = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path(), |pq| pq.as_str());
    let ctx = RequestContext::new(parts.method, uri, body).with_headers(parts.headers);
    gateway.handle_request(ctx).await.into_response()
}
