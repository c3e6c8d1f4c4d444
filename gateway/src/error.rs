//! Request-scoped errors and the pipeline's standard error handler.

use http::{header, HeaderValue, Method, StatusCode};
use serde::Serialize;

use crate::server::GatewayResponse;

#[derive(Debug, thiserror::Error)]
/// Everything that can fail while serving one request (or one batch sub-request).
pub enum GatewayError {
    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed { allowed: Vec<Method> },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("body too large")]
    PayloadTooLarge,

    #[error("{0}")]
    NotImplemented(String),

    #[error("transform: {0}")]
    Transform(#[from] crate::transform::TransformError),

    #[error("metric: {0:#}")]
    Metric(anyhow::Error),

    #[error("handler panicked: {0}")]
    Panic(String),
}

/// JSON body shared by error responses and the batch placeholder.
#[derive(Debug, Serialize)]
pub(crate) struct StatusBody<'a> {
    pub status: String,
    pub response: &'a str,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            // Transform failures come from the caller's query options.
            Self::BadRequest(_) | Self::Transform(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Metric(_) | Self::Panic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Standard error handler: every failure becomes a real status code with a JSON body.
    pub fn into_response(self) -> GatewayResponse {
        let status = self.status();
        let message = self.to_string();
        let mut resp = GatewayResponse::json(status, status_body(status, &message));

        if let Self::MethodNotAllowed { allowed } = self {
            let allow = allowed
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&allow) {
                resp.headers.insert(header::ALLOW, value);
            }
        }
        resp
    }
}

pub(crate) fn status_body(status: StatusCode, message: &str) -> String {
    let body = StatusBody {
        status: status.as_u16().to_string(),
        response: message,
    };
    serde_json::to_string(&body).unwrap_or_else(|_| message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_variants_to_status_codes() {
        assert_eq!(GatewayError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Metric(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn transform_failures_are_client_errors() {
        use crate::transform::TransformError;

        for err in [
            TransformError::MissingColumn("nope".into()),
            TransformError::InvalidDate {
                column: "date".into(),
                value: "\"yesterday\"".into(),
            },
            TransformError::TooManyBuckets {
                buckets: 10,
                limit: 5,
            },
        ] {
            assert_eq!(GatewayError::from(err).status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn error_response_carries_json_status_body() {
        let resp = GatewayError::Metric(anyhow::anyhow!("boom")).into_response();
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        let v: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(v["status"], "500");
        assert_eq!(v["response"], "metric: boom");
    }

    #[test]
    fn method_not_allowed_sets_allow_header() {
        let resp = GatewayError::MethodNotAllowed {
            allowed: vec![Method::GET, Method::POST],
        }
        .into_response();
        assert_eq!(resp.headers.get(header::ALLOW).unwrap(), "GET, POST");
    }
}
