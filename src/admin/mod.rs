//! Admin API
//!
//! HTTP surface through which the external health-checking collaborator
//! registers, removes and reports on instances. Mounted under the configured
//! prefix and guarded by the configured access tokens.

use crate::config::AdminConfig;
use crate::error::{ErrorBody, GatewayError};
use crate::registry::{ServiceInstance, ServiceSummary, SharedRegistry};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AdminState {
    registry: SharedRegistry,
    config: Arc<AdminConfig>,
}

impl AdminState {
    pub fn new(registry: SharedRegistry, config: AdminConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterRequest {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HealthUpdate {
    pub healthy: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServiceInstances {
    pub service_name: String,
    pub instances: Vec<ServiceInstance>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServiceList {
    pub services: Vec<ServiceSummary>,
}

type InstancePath = Path<(String, String, u16)>;

/// Malformed bodies are reported as `invalid_request` like every other admin error
fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, GatewayError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| GatewayError::InvalidRequest {
            reason: rejection.body_text(),
        })
}

/// Build the admin router. The caller nests it under `AdminConfig::prefix`.
pub fn router<S>(state: AdminState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/instances", post(register_instance))
        .route("/instances/:service/:host/:port", delete(deregister_instance))
        .route("/instances/:service/:host/:port/health", put(update_health))
        .route("/services", get(list_services))
        .route("/services/:service", get(list_instances))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

async fn require_token(
    State(state): State<AdminState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(state.config.header_name.as_str())
        .and_then(|v| v.to_str().ok());

    if !state.config.validate_token(token) {
        warn!(path = %req.uri().path(), "Rejected admin request without a valid token");
        let body = ErrorBody {
            error: "unauthorized",
            message: "missing or invalid admin token".to_string(),
            trace_id: None,
        };
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }

    next.run(req).await
}

async fn register_instance(
    State(state): State<AdminState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let body = parse_body(body)?;
    if body.service_name.trim().is_empty() || body.host.trim().is_empty() {
        return Err(GatewayError::InvalidRequest {
            reason: "service_name and host must not be empty".to_string(),
        });
    }

    let instance = ServiceInstance::new(body.service_name, body.host, body.port);
    state.registry.register(instance.clone())?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn deregister_instance(
    State(state): State<AdminState>,
    Path((service, host, port)): InstancePath,
) -> StatusCode {
    state.registry.deregister(&service, &host, port);
    StatusCode::NO_CONTENT
}

async fn update_health(
    State(state): State<AdminState>,
    Path((service, host, port)): InstancePath,
    body: Result<Json<HealthUpdate>, JsonRejection>,
) -> Response {
    let body = match parse_body(body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    if state
        .registry
        .mark_health(&service, &host, port, body.healthy)
    {
        return StatusCode::NO_CONTENT.into_response();
    }

    let body = ErrorBody {
        error: "instance_not_found",
        message: format!(
            "instance {}:{} is not registered for service '{}'",
            host, port, service
        ),
        trace_id: None,
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

async fn list_instances(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Json<ServiceInstances> {
    let instances = state.registry.list_healthy(&service).to_vec();
    Json(ServiceInstances {
        service_name: service,
        instances,
    })
}

async fn list_services(State(state): State<AdminState>) -> Json<ServiceList> {
    Json(ServiceList {
        services: state.registry.summaries(),
    })
}
