//! Per-request error taxonomy and its uniform client-facing representation.
//!
//! Every response the gateway generates itself (as opposed to bodies relayed
//! from an upstream) goes through [`GatewayError::into_response`], producing a
//! JSON body of the shape `{"error": "<code>", "message": "<text>"}`.
use std::time::Duration;

use axum::{
    body::Body as AxumBody,
    response::{IntoResponse, Response},
};
use http::{HeaderValue, StatusCode, header};
use thiserror::Error;

use crate::core::{circuit_breaker::CircuitState, headers::X_CIRCUIT_STATE};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// No route prefix matches the request path
    #[error("no route matches path '{path}'")]
    RouteNotFound { path: String },

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("request body exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("rate limit exceeded for client '{client}'")]
    RateLimited { client: String, retry_after: Duration },

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// The upstream's breaker rejected the call without touching the network
    #[error("circuit for service '{service}' is {state}")]
    CircuitOpen {
        service: String,
        state: CircuitState,
        retry_after: Option<Duration>,
    },

    #[error("gateway is at capacity, try again shortly")]
    Overloaded,

    #[error("service '{service}' unreachable after {attempts} attempt(s): {reason}")]
    UpstreamUnreachable {
        service: String,
        attempts: u32,
        reason: String,
    },

    #[error("service '{service}' timed out after {attempts} attempt(s)")]
    UpstreamTimeout { service: String, attempts: u32 },

    #[error("request exceeded the gateway deadline of {0:?}")]
    RequestTimeout(Duration),

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::CircuitOpen { .. }
            | GatewayError::Overloaded
            | GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout { .. } | GatewayError::RequestTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code placed in the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound { .. } => "route_not_found",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::Overloaded => "overloaded",
            GatewayError::UpstreamUnreachable { .. } => "upstream_unreachable",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::RequestTimeout(_) => "gateway_timeout",
            GatewayError::ShuttingDown => "shutting_down",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after, .. } => Some(*retry_after),
            GatewayError::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        let mut response = Response::new(AxumBody::from(body.to_string()));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        if let Some(retry_after) = self.retry_after() {
            // round up so clients never retry before the block actually lifts
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }

        if let GatewayError::CircuitOpen { state, .. } = &self {
            headers.insert(X_CIRCUIT_STATE, HeaderValue::from_static(state.as_str()));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn renders_uniform_error_body() {
        let response = GatewayError::RouteNotFound {
            path: "/api/v1/unknown".to_string(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = body_json(response).await;
        assert_eq!(body["error"], "route_not_found");
        assert_eq!(body["message"], "no route matches path '/api/v1/unknown'");
    }

    #[tokio::test]
    async fn circuit_open_carries_state_and_retry_after() {
        let response = GatewayError::CircuitOpen {
            service: "notification".to_string(),
            state: CircuitState::Open,
            retry_after: Some(Duration::from_millis(12_300)),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(X_CIRCUIT_STATE).unwrap(), "open");
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "13");
    }

    #[test]
    fn status_mapping_matches_taxonomy() {
        let unreachable = GatewayError::UpstreamUnreachable {
            service: "chat".to_string(),
            attempts: 4,
            reason: "connection refused".to_string(),
        };
        let timeout = GatewayError::UpstreamTimeout {
            service: "chat".to_string(),
            attempts: 4,
        };

        assert_eq!(unreachable.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::RateLimited {
                client: "10.0.0.1".to_string(),
                retry_after: Duration::from_secs(900)
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
