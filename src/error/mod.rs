//! Error types for the gateway core
//!
//! Registry, balancer and forwarding failures are returned as [`GatewayError`].
//! The router turns every failure into the same JSON error body so callers
//! never see a raw backend error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Result type used by the gateway core
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures produced by the registry, balancer, forwarding client and router
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// An instance with the same host and port is already registered for the service
    #[error("instance {host}:{port} is already registered for service '{service}'")]
    DuplicateInstance {
        service: String,
        host: String,
        port: u16,
    },

    /// The service has no healthy instance to route to
    #[error("no available instance for service '{service}'")]
    NoAvailableInstance { service: String },

    /// A single outbound attempt failed at the transport level or timed out
    #[error("upstream {instance} unavailable: {reason}")]
    UpstreamUnavailable { instance: String, reason: String },

    /// No route mapping matched the inbound request
    #[error("no route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// The caller's own deadline elapsed before a response was available
    #[error("request deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    /// The request was cancelled (caller went away or the gateway is shutting down)
    #[error("request cancelled")]
    Cancelled,

    /// The inbound request could not be read or re-built for forwarding
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl GatewayError {
    /// Short machine-readable kind, used in error bodies and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::DuplicateInstance { .. } => "duplicate_instance",
            GatewayError::NoAvailableInstance { .. } => "no_available_instance",
            GatewayError::UpstreamUnavailable { .. } => "upstream_unavailable",
            GatewayError::RouteNotFound { .. } => "route_not_found",
            GatewayError::DeadlineExceeded { .. } => "deadline_exceeded",
            GatewayError::Cancelled => "cancelled",
            GatewayError::InvalidRequest { .. } => "invalid_request",
        }
    }

    /// HTTP status the gateway answers with for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::DuplicateInstance { .. } => StatusCode::CONFLICT,
            GatewayError::NoAvailableInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the router may re-select another instance after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::UpstreamUnavailable { .. })
    }

    /// Build the uniform gateway error response, tagged with the request's trace id
    pub fn to_response(&self, trace_id: Option<&str>) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            trace_id: trace_id.map(str::to_string),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// JSON body of every gateway-level error response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = GatewayError::NoAvailableInstance {
            service: "svc".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.kind(), "no_available_instance");

        let err = GatewayError::DuplicateInstance {
            service: "svc".to_string(),
            host: "host1".to_string(),
            port: 80,
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            err.to_string(),
            "instance host1:80 is already registered for service 'svc'"
        );
    }

    #[test]
    fn test_only_upstream_errors_are_retryable() {
        assert!(GatewayError::UpstreamUnavailable {
            instance: "host1:80".to_string(),
            reason: "connection refused".to_string(),
        }
        .is_retryable());
        assert!(!GatewayError::Cancelled.is_retryable());
        assert!(!GatewayError::DeadlineExceeded { elapsed_ms: 10 }.is_retryable());
        assert!(!GatewayError::NoAvailableInstance {
            service: "svc".to_string()
        }
        .is_retryable());
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let err = GatewayError::UpstreamUnavailable {
            instance: "host1:80".to_string(),
            reason: "timed out".to_string(),
        };
        let response = err.to_response(Some("trace-1"));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "upstream_unavailable");
        assert_eq!(body["trace_id"], "trace-1");
    }
}
