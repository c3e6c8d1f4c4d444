//! Binding metric functions to HTTP endpoints.
//!
//! A [`Metric`] is an async function plus the identifier and source component it was declared
//! under. Binding it produces a handler that memoizes the serialized result per request URL (or
//! calls straight through when caching is off) and records a
//! [`MetricDescriptor`](crate::registry::MetricDescriptor) for it.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use http::{Method, StatusCode};

use crate::{
    error::GatewayError,
    registry::MetricDescriptor,
    server::{Gateway, GatewayBuilder, GatewayResponse, Handler, RequestContext, API_VERSION},
    table::MetricValue,
    transform::{transform, TransformOptions},
};

/// Arguments a metric function is called with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricArgs {
    params: HashMap<String, String>,
}

impl MetricArgs {
    pub fn new(params: HashMap<String, String>) -> Self {
        Self { params }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Like [`get`](Self::get), but a missing argument is an error.
    pub fn require(&self, name: &str) -> anyhow::Result<&str> {
        self.get(name)
            .ok_or_else(|| anyhow::anyhow!("missing argument: {name}"))
    }

    pub fn owner(&self) -> Option<&str> {
        self.get("owner")
    }

    pub fn repo(&self) -> Option<&str> {
        self.get("repo")
    }

    pub fn repo_url(&self) -> Option<&str> {
        self.get("repo_url")
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }
}

#[async_trait]
/// A data-producing function served by the gateway.
pub trait MetricFn: Send + Sync {
    async fn call(&self, args: MetricArgs) -> anyhow::Result<MetricValue>;
}

#[async_trait]
impl<F, Fut> MetricFn for F
where
    F: Fn(MetricArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<MetricValue>> + Send + 'static,
{
    async fn call(&self, args: MetricArgs) -> anyhow::Result<MetricValue> {
        (self)(args).await
    }
}

/// A metric function with the identity used to describe it.
#[derive(Clone)]
pub struct Metric {
    source: String,
    ident: String,
    func: Arc<dyn MetricFn>,
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("source", &self.source)
            .field("ident", &self.ident)
            .finish_non_exhaustive()
    }
}

impl Metric {
    /// `source` is the owning component (e.g. `GitHubAPI`); `ident` the function identifier
    /// (e.g. `issues_closed`).
    pub fn new(
        source: impl Into<String>,
        ident: impl Into<String>,
        func: impl MetricFn + 'static,
    ) -> Self {
        Self {
            source: source.into(),
            ident: ident.into(),
            func: Arc::new(func),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub async fn call(&self, args: MetricArgs) -> anyhow::Result<MetricValue> {
        self.func.call(args).await
    }
}

/// A component that contributes metric endpoints.
pub trait MetricSource {
    fn create_routes(&self, builder: &mut GatewayBuilder) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Per-endpoint binding options.
pub struct BindOptions {
    /// Memoize responses by request URL.
    pub cache: bool,
    pub metric_type: Option<String>,
    pub frontend_status: Option<String>,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            cache: true,
            metric_type: None,
            frontend_status: None,
        }
    }
}

impl BindOptions {
    pub fn uncached(mut self) -> Self {
        self.cache = false;
        self
    }

    pub fn metric_type(mut self, metric_type: impl Into<String>) -> Self {
        self.metric_type = Some(metric_type.into());
        self
    }

    pub fn frontend_status(mut self, status: impl Into<String>) -> Self {
        self.frontend_status = Some(status.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteKind {
    Repo,
    Git,
}

/// A metric bound to a route; invoked by the dispatch pipeline.
#[derive(Debug)]
pub(crate) struct BoundMetric {
    metric: Metric,
    cache: bool,
    kind: RouteKind,
}

impl BoundMetric {
    pub(crate) async fn handle(
        &self,
        ctx: &RequestContext,
        mut params: HashMap<String, String>,
        gateway: &Gateway,
    ) -> Result<GatewayResponse, GatewayError> {
        if self.kind == RouteKind::Git {
            if let Some(url) = params.get_mut("repo_url") {
                let keep = url.trim_end_matches('/').len();
                url.truncate(keep);
            }
        }

        let body = if self.cache {
            let mut opts = TransformOptions::from_query(&ctx.query)?;
            opts.max_buckets = gateway.max_resample_buckets();
            gateway
                .cache()
                .get_or_compute(&ctx.url(), || async {
                    let value = self
                        .metric
                        .call(MetricArgs::new(params))
                        .await
                        .map_err(GatewayError::Metric)?;
                    self.encode(value, &opts)
                })
                .await?
        } else {
            params.extend(ctx.query.iter().map(|(k, v)| (k.clone(), v.clone())));
            let value = self
                .metric
                .call(MetricArgs::new(params))
                .await
                .map_err(GatewayError::Metric)?;
            self.encode(value, &TransformOptions::default())?
        };

        Ok(GatewayResponse::json(StatusCode::OK, body))
    }

    fn encode(&self, value: MetricValue, opts: &TransformOptions) -> Result<String, GatewayError> {
        let encoded = transform(value, opts)?;
        if encoded.is_opaque() {
            tracing::warn!(
                event = "transform_opaque",
                source = %self.metric.source,
                metric = %self.metric.ident,
                "metric result is not valid JSON; returning it unchanged"
            );
        }
        Ok(encoded.into_string())
    }
}

impl GatewayBuilder {
    /// Serve `metric` at `/api/unstable/{owner}/{repo}/<endpoint>`.
    pub fn add_metric(
        &mut self,
        metric: Metric,
        endpoint: &str,
        opts: BindOptions,
    ) -> anyhow::Result<()> {
        let template = format!("/{API_VERSION}/{{owner}}/{{repo}}/{endpoint}");
        self.bind(metric, &template, RouteKind::Repo, opts)
    }

    /// Serve `metric` at `/api/unstable/git/<endpoint>/<repo_url>/`.
    pub fn add_git_metric(
        &mut self,
        metric: Metric,
        endpoint: &str,
        opts: BindOptions,
    ) -> anyhow::Result<()> {
        let template = format!("/{API_VERSION}/git/{endpoint}/{{*repo_url}}");
        self.bind(metric, &template, RouteKind::Git, opts.metric_type("git"))
    }

    /// Serve `metric` at `/api/unstable/{owner}/{repo}/timeseries/<endpoint>`.
    pub fn add_timeseries(&mut self, metric: Metric, endpoint: &str) -> anyhow::Result<()> {
        self.add_metric(
            metric,
            &format!("timeseries/{endpoint}"),
            BindOptions::default().metric_type("timeseries"),
        )
    }

    fn bind(
        &mut self,
        metric: Metric,
        template: &str,
        kind: RouteKind,
        opts: BindOptions,
    ) -> anyhow::Result<()> {
        let mut descriptor = MetricDescriptor::for_function(metric.source(), metric.ident(), template);
        descriptor.metric_type = opts.metric_type;
        if let Some(status) = opts.frontend_status {
            descriptor.frontend_status = status;
        }

        let bound = BoundMetric {
            metric,
            cache: opts.cache,
            kind,
        };
        self.route(template, Method::GET, Handler::Metric(Arc::new(bound)))?;
        self.registry().register(descriptor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::ResponseCache,
        registry::MetricRegistry,
        table::{Cell, Table},
    };
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn builder() -> GatewayBuilder {
        GatewayBuilder::new(
            Arc::new(ResponseCache::new(Duration::from_secs(3600))),
            Arc::new(MetricRegistry::new(None)),
        )
    }

    fn counting(calls: Arc<AtomicUsize>) -> Metric {
        Metric::new("GitHubAPI", "issues_closed", move |args: MetricArgs| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let table = Table::new(["owner", "repo", "calls"]).with_row(vec![
                    args.require("owner")?.into(),
                    args.require("repo")?.into(),
                    Cell::Int(n as i64),
                ]);
                anyhow::Ok(MetricValue::Table(table))
            }
        })
    }

    async fn get(gateway: &Gateway, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = gateway
            .handle_request(RequestContext::new(Method::GET, uri, Default::default()))
            .await;
        let body = serde_json::from_slice(&resp.body).unwrap_or(serde_json::Value::Null);
        (resp.status, body)
    }

    #[tokio::test]
    async fn cached_endpoint_computes_once_per_url() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut b = builder();
        b.add_metric(counting(Arc::clone(&calls)), "issues_closed", BindOptions::default())
            .unwrap();
        let gateway = b.build();

        let (status, first) = get(&gateway, "/api/unstable/chaoss/augur/issues_closed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first[0]["owner"], "chaoss");
        assert_eq!(first[0]["calls"], 1);

        let (_, again) = get(&gateway, "/api/unstable/chaoss/augur/issues_closed").await;
        assert_eq!(again[0]["calls"], 1);

        let (_, other_query) =
            get(&gateway, "/api/unstable/chaoss/augur/issues_closed?orient=values").await;
        assert_eq!(other_query, serde_json::json!([["chaoss", "augur", 2]]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn uncached_endpoint_merges_query_into_arguments() {
        let mut b = builder();
        let echo = Metric::new("Facade", "echo_args", |args: MetricArgs| async move {
            anyhow::Ok(MetricValue::from_serialize(args.params()))
        });
        b.add_metric(echo, "echo", BindOptions::default().uncached())
            .unwrap();
        let gateway = b.build();

        let (status, body) = get(&gateway, "/api/unstable/o/r/echo?period=week&repo=override").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["owner"], "o");
        assert_eq!(body["period"], "week");
        assert_eq!(body["repo"], "override");
    }

    #[tokio::test]
    async fn git_endpoint_strips_trailing_slash_from_repo_url() {
        let mut b = builder();
        let metric = Metric::new("Git", "lines_changed", |args: MetricArgs| async move {
            anyhow::Ok(MetricValue::Value(
                serde_json::json!({ "url": args.require("repo_url")? }),
            ))
        });
        b.add_git_metric(metric, "lines_changed", BindOptions::default())
            .unwrap();
        let gateway = b.build();

        let (status, body) =
            get(&gateway, "/api/unstable/git/lines_changed/github.com/chaoss/augur/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["url"], "github.com/chaoss/augur");

        let d = gateway.registry().get("Git", "lines-changed").unwrap();
        assert_eq!(d.metric_type.as_deref(), Some("git"));
    }

    #[tokio::test]
    async fn timeseries_prefixes_the_path_and_sets_the_type() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut b = builder();
        b.add_timeseries(counting(calls), "issues/closed").unwrap();
        let gateway = b.build();

        let (status, _) = get(&gateway, "/api/unstable/a/b/timeseries/issues/closed").await;
        assert_eq!(status, StatusCode::OK);

        let d = gateway.registry().get("GitHubAPI", "issues-closed").unwrap();
        assert_eq!(d.name, "Issues Closed");
        assert_eq!(d.endpoint, "/api/unstable/{owner}/{repo}/timeseries/issues/closed");
        assert_eq!(d.metric_type.as_deref(), Some("timeseries"));
    }

    #[tokio::test]
    async fn frontend_status_is_recorded() {
        let mut b = builder();
        b.add_metric(
            counting(Arc::new(AtomicUsize::new(0))),
            "closed",
            BindOptions::default().frontend_status("ready"),
        )
        .unwrap();
        let d = b.registry().get("GitHubAPI", "issues-closed").unwrap();
        assert_eq!(d.frontend_status, "ready");
    }

    #[tokio::test]
    async fn failing_metric_uses_the_standard_error_path_and_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let flaky = {
            let calls = Arc::clone(&calls);
            Metric::new("S", "flaky", move |_args: MetricArgs| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("upstream unavailable");
                    }
                    anyhow::Ok(MetricValue::Value(serde_json::json!("ok")))
                }
            })
        };
        let mut b = builder();
        b.add_metric(flaky, "flaky", BindOptions::default()).unwrap();
        let gateway = b.build();

        let (status, body) = get(&gateway, "/api/unstable/a/b/flaky").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "500");

        let (status, body) = get(&gateway, "/api/unstable/a/b/flaky").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn invalid_transform_options_are_a_bad_request() {
        let mut b = builder();
        b.add_metric(
            counting(Arc::new(AtomicUsize::new(0))),
            "closed",
            BindOptions::default(),
        )
        .unwrap();
        let gateway = b.build();

        let (status, _) = get(&gateway, "/api/unstable/a/b/closed?aggregate=median").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_group_by_column_is_a_bad_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut b = builder();
        b.add_metric(counting(Arc::clone(&calls)), "closed", BindOptions::default())
            .unwrap();
        let gateway = b.build();

        let (status, body) = get(&gateway, "/api/unstable/a/b/closed?group_by=nope").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "400");
        assert_eq!(body["response"], "transform: unknown column: nope");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resample_beyond_the_bucket_limit_is_a_bad_request() {
        let dated = Metric::new("GitHubAPI", "commits", |_args: MetricArgs| async move {
            let table = Table::new(["date", "n"])
                .with_row(vec!["2018-01-01".into(), 1_i64.into()])
                .with_row(vec!["2018-12-31".into(), 2_i64.into()]);
            anyhow::Ok(MetricValue::Table(table))
        });
        let mut b = builder().max_resample_buckets(100);
        b.add_metric(dated, "commits", BindOptions::default()).unwrap();
        let gateway = b.build();

        let (status, body) = get(&gateway, "/api/unstable/a/b/commits?resample=D").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["response"].as_str().unwrap().contains("limit of 100"));

        for rule in ["100000000D", "300000A"] {
            let (status, _) =
                get(&gateway, &format!("/api/unstable/a/b/commits?resample={rule}")).await;
            assert_ne!(status, StatusCode::INTERNAL_SERVER_ERROR, "{rule}");
        }
        let (status, _) = get(&gateway, "/api/unstable/a/b/commits?resample=M").await;
        assert_eq!(status, StatusCode::OK);
    }
}
