//! Gateway router
//!
//! Maps an inbound request to a logical service name and drives it through
//! the request state machine:
//!
//! ```text
//! RECEIVED -> RESOLVED -> FORWARDING -> SUCCEEDED
//!                             |
//!                             +-> RETRYING -> FORWARDING
//!                             +-> FAILED
//! ```
//!
//! Transport failures are retried against another instance up to the
//! configured attempt limit. Every failure reaches the caller as a uniform
//! gateway error response.

use crate::balancer::LoadBalancer;
use crate::config::RouteConfig;
use crate::context::RequestContext;
use crate::error::{GatewayError, GatewayResult};
use crate::forward::{ForwardingClient, OutboundRequest};
use crate::metrics::GatewayMetrics;
use crate::registry::InstanceKey;
use axum::body::Body;
use axum::http::header::HOST;
use axum::http::{Request, Response};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of one inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Resolved,
    Forwarding,
    Retrying,
    Succeeded,
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Resolved => "resolved",
            RequestState::Forwarding => "forwarding",
            RequestState::Retrying => "retrying",
            RequestState::Succeeded => "succeeded",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A compiled route mapping an inbound request to a service
#[derive(Debug, Clone)]
pub struct RouteMapping {
    /// Route name (optional)
    pub name: Option<String>,
    /// Path pattern
    pub path_pattern: String,
    /// Host to match, without port (empty = any host)
    pub host: Option<String>,
    /// Logical service name
    pub service: String,
    /// Whether to strip the prefix
    pub strip_prefix: bool,
    /// HTTP methods to match (empty = all)
    pub methods: Vec<String>,
    /// Route description
    pub description: Option<String>,
}

impl RouteMapping {
    pub fn new(path_pattern: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: None,
            path_pattern: path_pattern.into(),
            host: None,
            service: service.into(),
            strip_prefix: false,
            methods: vec![],
            description: None,
        }
    }

    /// Check if this route matches the given path, method and Host header
    pub fn matches(&self, path: &str, method: &str, host: Option<&str>) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
        {
            return false;
        }

        if let Some(expected) = &self.host {
            let actual = host.map(strip_port).unwrap_or_default();
            if !expected.eq_ignore_ascii_case(actual) {
                return false;
            }
        }

        self.path_matches(path)
    }

    fn path_matches(&self, path: &str) -> bool {
        let pattern = &self.path_pattern;

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return path == prefix || path.starts_with(&format!("{}/", prefix));
        }

        if let Some(base) = pattern.strip_suffix('/') {
            return path == base || path.starts_with(pattern.as_str());
        }

        path == pattern || path.starts_with(&format!("{}/", pattern))
    }

    /// Path and query to send to the backend
    pub fn target_path(&self, path: &str, query: Option<&str>) -> String {
        let target_path = if self.strip_prefix {
            self.strip_path_prefix(path)
        } else {
            path.to_string()
        };

        let path_part = if target_path.starts_with('/') {
            target_path
        } else {
            format!("/{}", target_path)
        };

        match query {
            Some(q) if !q.is_empty() => format!("{}?{}", path_part, q),
            _ => path_part,
        }
    }

    fn strip_path_prefix(&self, path: &str) -> String {
        let pattern = &self.path_pattern;
        let prefix = pattern
            .strip_suffix("/*")
            .or_else(|| pattern.strip_suffix('/'))
            .unwrap_or(pattern);

        match path.strip_prefix(prefix) {
            Some("") | Some("/") => "/".to_string(),
            Some(remainder) if remainder.starts_with('/') => remainder.to_string(),
            _ => path.to_string(),
        }
    }
}

impl From<&RouteConfig> for RouteMapping {
    fn from(route: &RouteConfig) -> Self {
        Self {
            name: route.name.clone(),
            path_pattern: route.path.clone(),
            host: route.host.clone(),
            service: route.service.clone(),
            strip_prefix: route.strip_prefix,
            methods: route.methods.clone(),
            description: route.description.clone(),
        }
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.ends_with(']') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Terminal result of running one request through the state machine
#[derive(Debug)]
pub struct Dispatch {
    pub state: RequestState,
    /// Number of forwarding attempts made
    pub attempts: u32,
    /// Service the request resolved to, if any route matched
    pub service: Option<String>,
    pub result: GatewayResult<Response<Body>>,
}

impl Dispatch {
    pub fn into_response(self, trace_id: &str) -> Response<Body> {
        match self.result {
            Ok(response) => response,
            Err(err) => err.to_response(Some(trace_id)),
        }
    }
}

// Keeps the in-flight gauge correct even when the request future is dropped
struct ActiveRequest<'a> {
    metrics: &'a GatewayMetrics,
    service: String,
}

impl<'a> ActiveRequest<'a> {
    fn enter(metrics: &'a GatewayMetrics, service: &str) -> Self {
        metrics.inc_active_requests(service);
        Self {
            metrics,
            service: service.to_string(),
        }
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.metrics.dec_active_requests(&self.service);
    }
}

/// Routes inbound requests to load-balanced backend instances
pub struct GatewayRouter {
    routes: Vec<RouteMapping>,
    balancer: Arc<LoadBalancer>,
    client: ForwardingClient,
    metrics: Arc<GatewayMetrics>,
    max_attempts: u32,
}

impl GatewayRouter {
    pub fn new(
        routes: Vec<RouteMapping>,
        balancer: Arc<LoadBalancer>,
        client: ForwardingClient,
        metrics: Arc<GatewayMetrics>,
        max_attempts: u32,
    ) -> Self {
        Self {
            routes,
            balancer,
            client,
            metrics,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create route mappings from configuration
    pub fn routes_from_config(routes: &[RouteConfig]) -> Vec<RouteMapping> {
        routes
            .iter()
            .filter(|r| r.enabled)
            .map(RouteMapping::from)
            .collect()
    }

    pub fn routes(&self) -> &[RouteMapping] {
        &self.routes
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Find the first route matching the request
    pub fn resolve(&self, path: &str, method: &str, host: Option<&str>) -> Option<&RouteMapping> {
        self.routes.iter().find(|r| r.matches(path, method, host))
    }

    /// Run a request through the state machine without rendering errors
    pub async fn dispatch(&self, ctx: &RequestContext, req: Request<Body>) -> Dispatch {
        let mut state = RequestState::Received;
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let Some(route) = self.resolve(&path, &method, host.as_deref()) else {
            transition(ctx, &mut state, RequestState::Failed);
            return Dispatch {
                state,
                attempts: 0,
                service: None,
                result: Err(GatewayError::RouteNotFound { method, path }),
            };
        };
        let service = route.service.clone();
        let target_path = route.target_path(&path, req.uri().query());
        let _active = ActiveRequest::enter(&self.metrics, &service);
        transition(ctx, &mut state, RequestState::Resolved);

        let failed = |mut state: RequestState, attempts: u32, err: GatewayError| {
            transition(ctx, &mut state, RequestState::Failed);
            Dispatch {
                state,
                attempts,
                service: Some(service.clone()),
                result: Err(err),
            }
        };

        let request = match OutboundRequest::from_request(req, target_path).await {
            Ok(request) => request,
            Err(err) => return failed(state, 0, err),
        };

        let mut excluded: Vec<InstanceKey> = Vec::new();
        let mut last_error: Option<GatewayError> = None;
        let mut attempts = 0;

        loop {
            let decision = match self.balancer.select_excluding(&service, &excluded) {
                Ok(decision) => decision,
                // No alternative left: surface the failure that triggered the retry
                Err(err) => return failed(state, attempts, last_error.unwrap_or(err)),
            };
            transition(ctx, &mut state, RequestState::Forwarding);
            attempts += 1;

            match self.client.forward(ctx, &decision.instance, &request).await {
                Ok(response) => {
                    transition(ctx, &mut state, RequestState::Succeeded);
                    return Dispatch {
                        state,
                        attempts,
                        service: Some(service.clone()),
                        result: Ok(response),
                    };
                }
                Err(err) if err.is_retryable() && attempts < self.max_attempts => {
                    debug!(
                        trace_id = %ctx.trace_id(),
                        instance = %decision.instance.authority(),
                        attempt = attempts,
                        error = %err,
                        "Attempt failed, re-selecting"
                    );
                    excluded.push(decision.instance.key());
                    last_error = Some(err);
                    self.metrics.record_retry(&service);
                    transition(ctx, &mut state, RequestState::Retrying);
                }
                Err(err) => return failed(state, attempts, err),
            }
        }
    }

    /// Handle a request end to end and render the response
    pub async fn handle(&self, ctx: &RequestContext, req: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let dispatch = self.dispatch(ctx, req).await;
        let service = dispatch
            .service
            .clone()
            .unwrap_or_else(|| "unmatched".to_string());

        match &dispatch.result {
            Ok(_) => {}
            Err(GatewayError::Cancelled) => {
                debug!(trace_id = %ctx.trace_id(), service = %service, "Request cancelled");
            }
            Err(GatewayError::RouteNotFound { .. }) => {
                info!(trace_id = %ctx.trace_id(), method = %method, path = %path, "No matching route");
            }
            Err(err) => {
                warn!(
                    trace_id = %ctx.trace_id(),
                    service = %service,
                    attempts = dispatch.attempts,
                    error = %err,
                    "Request failed"
                );
            }
        }

        let response = dispatch.into_response(ctx.trace_id());
        self.metrics
            .record_request(&method, &service, response.status().as_u16(), start.elapsed());
        response
    }
}

fn transition(ctx: &RequestContext, state: &mut RequestState, next: RequestState) {
    debug!(trace_id = %ctx.trace_id(), from = %state, to = %next, "Request state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InstanceRegistry, ServiceInstance, SharedRegistry};
    use crate::balancer::RoundRobin;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn spawn_backend(name: &'static str) -> u16 {
        let app = Router::new().route("/users", get(move || async move { name }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Accepts connections and never answers
    async fn spawn_silent_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        port
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn create_test_route() -> RouteMapping {
        RouteMapping {
            strip_prefix: true,
            description: Some("Test route".to_string()),
            ..RouteMapping::new("/api/*", "svc")
        }
    }

    fn router_with(registry: &SharedRegistry, max_attempts: u32) -> GatewayRouter {
        let metrics = Arc::new(GatewayMetrics::new());
        let balancer = Arc::new(LoadBalancer::new(
            registry.clone(),
            Arc::new(RoundRobin::new()),
        ));
        let client = ForwardingClient::new(
            registry.clone(),
            metrics.clone(),
            Duration::from_millis(500),
        );
        GatewayRouter::new(vec![create_test_route()], balancer, client, metrics, max_attempts)
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_route_matching() {
        let route = create_test_route();

        assert!(route.matches("/api/users", "GET", None));
        assert!(route.matches("/api/users/1", "POST", None));
        assert!(route.matches("/api", "GET", None));
        assert!(!route.matches("/other/path", "GET", None));
        assert!(!route.matches("/apiary", "GET", None));
    }

    #[test]
    fn test_method_filtering() {
        let route = RouteMapping {
            methods: vec!["GET".to_string(), "POST".to_string()],
            ..create_test_route()
        };

        assert!(route.matches("/api/users", "get", None));
        assert!(route.matches("/api/users", "POST", None));
        assert!(!route.matches("/api/users", "DELETE", None));
    }

    #[test]
    fn test_host_matching() {
        let route = RouteMapping {
            host: Some("users.example.com".to_string()),
            ..create_test_route()
        };

        assert!(route.matches("/api/x", "GET", Some("users.example.com")));
        assert!(route.matches("/api/x", "GET", Some("Users.Example.com:8080")));
        assert!(!route.matches("/api/x", "GET", Some("orders.example.com")));
        assert!(!route.matches("/api/x", "GET", None));
    }

    #[test]
    fn test_target_path_with_strip_prefix() {
        let route = create_test_route();

        assert_eq!(route.target_path("/api/users", None), "/users");
        assert_eq!(route.target_path("/api/users/1", None), "/users/1");
        assert_eq!(route.target_path("/api/users", Some("page=1")), "/users?page=1");
        assert_eq!(route.target_path("/api", None), "/");
    }

    #[test]
    fn test_target_path_without_strip_prefix() {
        let route = RouteMapping {
            strip_prefix: false,
            ..create_test_route()
        };

        assert_eq!(route.target_path("/api/users", None), "/api/users");
        assert_eq!(route.target_path("/api/users", Some("")), "/api/users");
    }

    #[test]
    fn test_routes_from_config_skips_disabled() {
        let routes = vec![
            RouteConfig {
                name: Some("a".to_string()),
                path: "/a/*".to_string(),
                host: None,
                service: "a".to_string(),
                methods: vec![],
                strip_prefix: false,
                description: None,
                enabled: true,
            },
            RouteConfig {
                name: Some("b".to_string()),
                path: "/b/*".to_string(),
                host: None,
                service: "b".to_string(),
                methods: vec![],
                strip_prefix: false,
                description: None,
                enabled: false,
            },
        ];

        let mappings = GatewayRouter::routes_from_config(&routes);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].service, "a");
    }

    #[tokio::test]
    async fn test_unmatched_route() {
        let registry = Arc::new(InstanceRegistry::new());
        let router = router_with(&registry, 2);
        let ctx = RequestContext::new(Duration::from_secs(1));

        let dispatch = router.dispatch(&ctx, request("/nowhere")).await;
        assert_eq!(dispatch.state, RequestState::Failed);
        assert!(dispatch.service.is_none());
        assert!(matches!(dispatch.result, Err(GatewayError::RouteNotFound { .. })));
    }

    #[tokio::test]
    async fn test_unhealthy_only_instance_fails_without_forwarding() {
        let registry = Arc::new(InstanceRegistry::new());
        registry
            .register(ServiceInstance::new("svc", "127.0.0.1", 1))
            .unwrap();
        registry.mark_health("svc", "127.0.0.1", 1, false);
        let router = router_with(&registry, 2);
        let ctx = RequestContext::new(Duration::from_secs(1));

        let dispatch = router.dispatch(&ctx, request("/api/users")).await;
        assert_eq!(dispatch.state, RequestState::Failed);
        assert_eq!(dispatch.attempts, 0);
        assert!(matches!(
            dispatch.result,
            Err(GatewayError::NoAvailableInstance { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_renders_gateway_error() {
        let registry = Arc::new(InstanceRegistry::new());
        let router = router_with(&registry, 2);
        let ctx = RequestContext::with_trace_id("trace-9", Duration::from_secs(1));

        let response = router.handle(&ctx, request("/api/users")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "no_available_instance");
        assert_eq!(body["trace_id"], "trace-9");
    }

    #[tokio::test]
    async fn test_forwards_with_stripped_prefix() {
        let port = spawn_backend("a").await;
        let registry = Arc::new(InstanceRegistry::new());
        registry
            .register(ServiceInstance::new("svc", "127.0.0.1", port))
            .unwrap();
        let router = router_with(&registry, 2);
        let ctx = RequestContext::new(Duration::from_secs(2));

        let dispatch = router.dispatch(&ctx, request("/api/users")).await;
        assert_eq!(dispatch.state, RequestState::Succeeded);
        assert_eq!(dispatch.attempts, 1);
        assert_eq!(dispatch.service.as_deref(), Some("svc"));

        let response = dispatch.result.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "a");
    }

    #[tokio::test]
    async fn test_retries_on_another_instance() {
        let dead = closed_port().await;
        let live = spawn_backend("b").await;
        let registry = Arc::new(InstanceRegistry::new());
        registry
            .register(ServiceInstance::new("svc", "127.0.0.1", dead))
            .unwrap();
        registry
            .register(ServiceInstance::new("svc", "127.0.0.1", live))
            .unwrap();
        let router = router_with(&registry, 2);
        let ctx = RequestContext::new(Duration::from_secs(2));

        // Round robin starts at the first registered instance, which refuses connections
        let dispatch = router.dispatch(&ctx, request("/api/users")).await;
        assert_eq!(dispatch.state, RequestState::Succeeded);
        assert_eq!(dispatch.attempts, 2);
        assert_eq!(body_text(dispatch.result.unwrap()).await, "b");

        assert!(!registry.is_healthy(&InstanceKey::new("svc", "127.0.0.1", dead)));
        assert!(registry.is_healthy(&InstanceKey::new("svc", "127.0.0.1", live)));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let registry = Arc::new(InstanceRegistry::new());
        let mut listeners = Vec::new();
        for _ in 0..3 {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        for listener in listeners {
            let port = listener.local_addr().unwrap().port();
            registry
                .register(ServiceInstance::new("svc", "127.0.0.1", port))
                .unwrap();
        }
        let router = router_with(&registry, 2);
        let ctx = RequestContext::new(Duration::from_secs(2));

        let dispatch = router.dispatch(&ctx, request("/api/users")).await;
        assert_eq!(dispatch.state, RequestState::Failed);
        assert_eq!(dispatch.attempts, 2);
        assert!(matches!(
            dispatch.result,
            Err(GatewayError::UpstreamUnavailable { .. })
        ));
        assert_eq!(registry.healthy_count("svc"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_is_not_retried() {
        let port = spawn_backend("a").await;
        let registry = Arc::new(InstanceRegistry::new());
        registry
            .register(ServiceInstance::new("svc", "127.0.0.1", port))
            .unwrap();
        let router = router_with(&registry, 3);
        let ctx = RequestContext::new(Duration::from_secs(2));
        ctx.cancel();

        let dispatch = router.dispatch(&ctx, request("/api/users")).await;
        assert_eq!(dispatch.state, RequestState::Failed);
        assert_eq!(dispatch.attempts, 1);
        assert_eq!(dispatch.result.unwrap_err(), GatewayError::Cancelled);
        assert_eq!(registry.healthy_count("svc"), 1);
    }

    #[tokio::test]
    async fn test_single_dead_instance_surfaces_upstream_error() {
        let dead = closed_port().await;
        let registry = Arc::new(InstanceRegistry::new());
        registry
            .register(ServiceInstance::new("svc", "127.0.0.1", dead))
            .unwrap();
        let router = router_with(&registry, 2);
        let ctx = RequestContext::new(Duration::from_secs(2));

        let dispatch = router.dispatch(&ctx, request("/api/users")).await;
        assert_eq!(dispatch.state, RequestState::Failed);
        assert_eq!(dispatch.attempts, 1);
        assert_eq!(
            dispatch.into_response("t").status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_dropped_dispatch_releases_instance() {
        let port = spawn_silent_backend().await;
        let key = InstanceKey::new("svc", "127.0.0.1", port);
        let registry = Arc::new(InstanceRegistry::new());
        registry
            .register(ServiceInstance::new("svc", "127.0.0.1", port))
            .unwrap();

        let metrics = Arc::new(GatewayMetrics::new());
        let balancer = Arc::new(LoadBalancer::new(
            registry.clone(),
            Arc::new(RoundRobin::new()),
        ));
        let client = ForwardingClient::new(registry.clone(), metrics.clone(), Duration::from_secs(5));
        let router = GatewayRouter::new(
            vec![create_test_route()],
            balancer.clone(),
            client,
            metrics.clone(),
            2,
        );
        let ctx = RequestContext::new(Duration::from_secs(10));

        // The caller gives up long before the forward timeout
        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            router.dispatch(&ctx, request("/api/users")),
        )
        .await;
        assert!(outcome.is_err());

        assert_eq!(balancer.in_flight(&key), 0);
        assert!(registry.is_healthy(&key));
        assert!(metrics
            .prometheus_output()
            .contains("gateway_active_requests{service=\"svc\"} 0"));
    }
}
