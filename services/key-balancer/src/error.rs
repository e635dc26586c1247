//! Per-request error types and the JSON error envelope
//!
//! Every failure the proxy produces itself (as opposed to a relayed upstream
//! status) is rendered as
//! `{"error":{"type":"...","code":"...","message":"...","request_id":"req_..."}}`.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("invalid JSON request: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// No key could be selected. `retry_after` is the pool's shortest wait
    /// until a token frees up.
    #[error("{source}")]
    RateLimited {
        #[source]
        source: key_pool::Error,
        retry_after: Duration,
    },

    #[error("failed to contact upstream API: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream timeout after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidBody(_) | ProxyError::MalformedJson(_) => StatusCode::BAD_REQUEST,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `(type, code)` pair of the envelope.
    fn kind(&self) -> (&'static str, &'static str) {
        match self {
            ProxyError::InvalidBody(_) => ("invalid_request_error", "invalid_body"),
            ProxyError::MalformedJson(_) => ("invalid_request_error", "malformed_json"),
            ProxyError::RateLimited { .. } => ("rate_limit_error", "rate_limit_exceeded"),
            ProxyError::UpstreamUnreachable(_) => ("upstream_error", "upstream_unreachable"),
            ProxyError::UpstreamTimeout(_) => ("upstream_error", "upstream_timeout"),
            ProxyError::Internal(_) => ("proxy_error", "internal_error"),
        }
    }

    /// Render the error envelope, tagged with the request id.
    pub fn into_response(self, request_id: &str) -> Response {
        let (error_type, code) = self.kind();
        let body = serde_json::json!({
            "error": {
                "type": error_type,
                "code": code,
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        let mut response = (
            self.status(),
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response();

        if let ProxyError::RateLimited { retry_after, .. } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
        }
        response
    }
}

/// Whole seconds, rounded up, never below one.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn status_codes_per_variant() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let cases = [
            (ProxyError::InvalidBody("too large".into()), 400),
            (ProxyError::MalformedJson(json_err), 400),
            (
                ProxyError::RateLimited {
                    source: key_pool::Error::RateLimited,
                    retry_after: Duration::ZERO,
                },
                429,
            ),
            (ProxyError::UpstreamUnreachable("refused".into()), 502),
            (ProxyError::UpstreamTimeout(Duration::from_secs(300)), 504),
            (ProxyError::Internal("oops".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.status().as_u16(), status, "{err:?}");
        }
    }

    #[tokio::test]
    async fn envelope_carries_type_code_and_request_id() {
        let err = ProxyError::UpstreamUnreachable("connection refused".into());
        let response = err.into_response("req_abc123");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "upstream_error");
        assert_eq!(json["error"]["code"], "upstream_unreachable");
        assert_eq!(json["error"]["request_id"], "req_abc123");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("connection refused")
        );
    }

    #[tokio::test]
    async fn rate_limited_envelope_includes_cause_and_retry_after() {
        let err = ProxyError::RateLimited {
            source: key_pool::Error::Exhausted {
                attempts: 3,
                source: Box::new(key_pool::Error::RateLimited),
            },
            retry_after: Duration::from_millis(1_500),
        };
        let response = err.into_response("req_1");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");

        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(json["error"]["code"], "rate_limit_exceeded");
        assert_eq!(
            json["error"]["message"],
            "failed to get API key after 3 attempts: all API keys are rate limited, please wait"
        );
    }

    #[test]
    fn retry_after_rounds_up_to_whole_seconds() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(200)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(60)), 60);
        assert_eq!(retry_after_secs(Duration::from_millis(1_500)), 2);
    }

    #[tokio::test]
    async fn malformed_json_is_a_client_error() {
        let err: ProxyError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        let json = body_json(err.into_response("req_2")).await;
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["code"], "malformed_json");
    }
}
