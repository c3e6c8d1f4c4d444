//! Batch dispatch: many logical requests in one HTTP call.
//!
//! `POST /api/unstable/batch` takes a JSON array of `{method, path, body?}` items and answers
//! with a JSON array of `{path, status, response}` in the same order, under HTTP 207. Items run
//! sequentially, each through the full pipeline with its own fresh [`RequestContext`]. A failing
//! (or panicking) item is reported in its own slot and never aborts its siblings.

use std::time::Instant;

use bytes::Bytes;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{status_body, GatewayError},
    server::{Gateway, GatewayResponse, RequestContext},
};

const BATCH_DEFAULTS_MESSAGE: &str = "Defaults for batch requests not implemented. Please POST a JSON array of requests to this endpoint for now.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// One logical request inside a batch.
pub struct BatchRequestItem {
    pub method: String,
    /// Target path, optionally with a query string.
    pub path: String,
    /// A JSON string is sent verbatim; any other value is re-serialized.
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Outcome of one batch item.
pub struct BatchResponseItem {
    /// The item's `path`, echoed back.
    pub path: String,
    pub status: u16,
    /// The sub-response body as text.
    pub response: String,
}

impl BatchResponseItem {
    fn from_response(path: String, resp: &GatewayResponse) -> Self {
        Self {
            path,
            status: resp.status.as_u16(),
            response: resp.body_str().into_owned(),
        }
    }

    fn error(path: String, status: StatusCode, message: &str) -> Self {
        Self {
            path,
            status: status.as_u16(),
            response: status_body(status, message),
        }
    }
}

/// Handler bound at `/api/unstable/batch`.
pub(crate) async fn handle_batch(
    gateway: &Gateway,
    ctx: &RequestContext,
) -> Result<GatewayResponse, GatewayError> {
    if ctx.method == Method::GET {
        return Err(GatewayError::NotImplemented(BATCH_DEFAULTS_MESSAGE.to_string()));
    }

    let raw: Vec<Value> = serde_json::from_slice(&ctx.body).map_err(|err| {
        GatewayError::BadRequest(format!("batch body must be a JSON array of requests: {err}"))
    })?;

    let started = Instant::now();
    tracing::info!(event = "batch_started", items = raw.len(), "dispatching batch");

    let mut responses = Vec::with_capacity(raw.len());
    for (index, value) in raw.into_iter().enumerate() {
        let resp = match parse_item(value) {
            Ok(item) => dispatch_item(gateway, index, item).await,
            Err((path, message)) => {
                tracing::warn!(event = "batch_item_invalid", index, error = %message);
                BatchResponseItem::error(path, StatusCode::BAD_REQUEST, &message)
            }
        };
        responses.push(resp);
    }

    log_finished(&responses, started);
    let body = serde_json::to_string(&responses)
        .map_err(|err| GatewayError::Metric(anyhow::Error::new(err)))?;
    Ok(GatewayResponse::json(StatusCode::MULTI_STATUS, body))
}

/// Run `items` sequentially through `gateway`, one response per item in input order.
pub async fn dispatch_batch(
    gateway: &Gateway,
    items: Vec<BatchRequestItem>,
) -> Vec<BatchResponseItem> {
    let started = Instant::now();
    let mut responses = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        responses.push(dispatch_item(gateway, index, item).await);
    }
    log_finished(&responses, started);
    responses
}

fn parse_item(value: Value) -> Result<BatchRequestItem, (String, String)> {
    let path = value
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    serde_json::from_value(value)
        .map_err(|err| (path, format!("invalid batch item: {err}")))
}

async fn dispatch_item(gateway: &Gateway, index: usize, item: BatchRequestItem) -> BatchResponseItem {
    let BatchRequestItem { method, path, body } = item;

    let method = match Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            let message = format!("invalid method: {method}");
            tracing::warn!(event = "batch_item_invalid", index, error = %message);
            return BatchResponseItem::error(path, StatusCode::BAD_REQUEST, &message);
        }
    };

    let body = match body {
        None | Some(Value::Null) => Bytes::new(),
        Some(Value::String(s)) => Bytes::from(s),
        Some(other) => Bytes::from(other.to_string()),
    };

    // Panics are already turned into 500 responses by the pipeline.
    let resp = gateway
        .handle_request(RequestContext::new(method, &path, body))
        .await;
    if resp.status.is_server_error() {
        tracing::warn!(
            event = "batch_item_failed",
            index,
            path = %path,
            status = resp.status.as_u16(),
            "batch item failed"
        );
    }
    BatchResponseItem::from_response(path, &resp)
}

fn log_finished(responses: &[BatchResponseItem], started: Instant) {
    let failed = responses.iter().filter(|r| r.status >= 400).count();
    tracing::info!(
        event = "batch_finished",
        items = responses.len(),
        failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "batch finished"
    );
}
