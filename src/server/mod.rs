//! Gateway server assembly
//!
//! Wires the registry, balancer, forwarding client and router together from a
//! [`GatewayConfig`], mounts the built-in endpoints and serves until the
//! shutdown token is cancelled.

use crate::admin::{self, AdminState};
use crate::balancer::LoadBalancer;
use crate::config::GatewayConfig;
use crate::context::RequestContext;
use crate::forward::ForwardingClient;
use crate::health::{HealthChecker, HealthStatus};
use crate::metrics::GatewayMetrics;
use crate::registry::{InstanceRegistry, ServiceInstance, SharedRegistry};
use crate::router::GatewayRouter;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    router: Arc<GatewayRouter>,
    metrics: Arc<GatewayMetrics>,
    health: Arc<HealthChecker>,
    deadline: Duration,
    shutdown: CancellationToken,
}

/// A fully wired gateway
pub struct Gateway {
    config: GatewayConfig,
    registry: SharedRegistry,
    metrics: Arc<GatewayMetrics>,
    health: Arc<HealthChecker>,
    router: Arc<GatewayRouter>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Build the gateway and register the statically configured instances
    pub fn new(config: GatewayConfig) -> crate::Result<Self> {
        let registry: SharedRegistry = Arc::new(InstanceRegistry::new());
        for service in &config.services {
            for instance in &service.instances {
                registry.register(ServiceInstance::new(
                    service.name.clone(),
                    instance.host.clone(),
                    instance.port,
                ))?;
            }
        }

        let metrics = Arc::new(GatewayMetrics::new());
        let balancer = Arc::new(LoadBalancer::from_config(registry.clone(), &config.balancer));
        let client = ForwardingClient::new(
            registry.clone(),
            metrics.clone(),
            config.balancer.forward_timeout(),
        );
        let routes = GatewayRouter::routes_from_config(&config.routes);
        let routed_services = routes.iter().map(|r| r.service.clone()).collect();
        let router = Arc::new(GatewayRouter::new(
            routes,
            balancer,
            client,
            metrics.clone(),
            config.balancer.max_attempts,
        ));
        let health = Arc::new(HealthChecker::new(registry.clone(), routed_services));

        Ok(Self {
            config,
            registry,
            metrics,
            health,
            router,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Token that stops the server and cancels every in-flight request
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Build the HTTP application
    pub fn app(&self) -> Router {
        let state = AppState {
            router: self.router.clone(),
            metrics: self.metrics.clone(),
            health: self.health.clone(),
            deadline: self.config.request_deadline(),
            shutdown: self.shutdown.clone(),
        };

        let mut app = Router::new();
        if self.config.health.enabled {
            app = app
                .route(&self.config.health.path, get(health_handler))
                .route(&self.config.health.ready_path, get(ready_handler));
        }
        if self.config.metrics.enabled {
            app = app.route(&self.config.metrics.path, get(metrics_handler));
        }
        if self.config.admin.enabled {
            let admin_state = AdminState::new(self.registry.clone(), self.config.admin.clone());
            app = app.nest(&self.config.admin.prefix, admin::router(admin_state));
        }

        app.fallback(proxy_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Periodically remove instances that stayed unhealthy past the retention period
    pub fn spawn_pruner(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let retention = self.config.balancer.unhealthy_retention();
        let period = retention.clamp(Duration::from_secs(1), Duration::from_secs(30));
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let pruned = registry.prune_unhealthy(retention);
                        if !pruned.is_empty() {
                            info!(count = pruned.len(), "Pruned unhealthy instances");
                        }
                    }
                }
            }
            debug!("Pruner stopped");
        })
    }

    /// Serve on `listener` until the shutdown token is cancelled
    pub async fn serve(self, listener: TcpListener) -> crate::Result<()> {
        let app = self.app();
        let pruner = self.spawn_pruner();
        let shutdown = self.shutdown.clone();
        let health = self.health.clone();

        let addr = listener.local_addr()?;
        info!("Starting gateway server on {}", addr);
        info!("Routes configured: {}", self.router.routes().len());
        info!(
            "Services registered: {}",
            self.registry.service_names().len()
        );

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                health.set_draining();
                info!("Shutting down gateway server");
            })
            .await?;

        pruner.await?;
        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.health.liveness()))
}

/// Readiness handler
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.readiness();
    let status = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(health))
}

/// Metrics handler
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.prometheus_output())
}

/// Proxy handler - routes every other request to a backend instance
async fn proxy_handler(State(state): State<AppState>, req: Request<Body>) -> impl IntoResponse {
    let ctx = RequestContext::from_headers(req.headers(), state.deadline, &state.shutdown);
    state.router.handle(&ctx, req).await
}
