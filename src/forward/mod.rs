//! Forwarding client
//!
//! Sends one outbound attempt to a selected instance:
//! - Bounded by the forward timeout and the request's own deadline
//! - Marks the instance unhealthy on timeout or connection failure
//! - Never retries on its own; the router decides whether to re-select
//! - Passes successful responses through with status, headers and body intact

use crate::context::{RequestContext, REQUEST_ID_HEADER};
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::GatewayMetrics;
use crate::registry::{InstanceKey, ServiceInstance, SharedRegistry};
use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, HOST};
use axum::http::{HeaderMap, Method, Request, Response};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of one forwarding try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Timeout,
    ConnectionError,
    Cancelled,
    DeadlineExceeded,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::ConnectionError => "connection_error",
            AttemptOutcome::Cancelled => "cancelled",
            AttemptOutcome::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// One forwarding try, kept only for the duration of the attempt
#[derive(Debug)]
struct OutboundAttempt {
    target: InstanceKey,
    started: Instant,
}

impl OutboundAttempt {
    fn start(instance: &ServiceInstance) -> Self {
        Self {
            target: instance.key(),
            started: Instant::now(),
        }
    }

    fn finish(self, outcome: AttemptOutcome, metrics: &GatewayMetrics) {
        let latency = self.started.elapsed();
        metrics.record_attempt(&self.target.service_name, outcome.as_str(), latency);
        debug!(
            instance = %self.target,
            outcome = outcome.as_str(),
            latency_ms = latency.as_millis() as u64,
            "Outbound attempt finished"
        );
    }
}

/// A buffered inbound request, ready to be sent to any instance
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path and query as sent to the backend
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Buffer an inbound request so it can be re-sent on retry
    pub async fn from_request(
        req: Request<Body>,
        path_and_query: impl Into<String>,
    ) -> GatewayResult<Self> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| GatewayError::InvalidRequest {
                reason: format!("failed to read request body: {}", e),
            })?;

        Ok(Self {
            method: parts.method,
            path_and_query: path_and_query.into(),
            headers: parts.headers,
            body,
        })
    }
}

/// Client issuing single outbound attempts
#[derive(Clone)]
pub struct ForwardingClient {
    client: Client<HttpConnector, Full<Bytes>>,
    registry: SharedRegistry,
    metrics: Arc<GatewayMetrics>,
    timeout: Duration,
}

impl ForwardingClient {
    pub fn new(registry: SharedRegistry, metrics: Arc<GatewayMetrics>, timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(timeout));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            registry,
            metrics,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` to `instance` once.
    ///
    /// Timeouts and transport failures mark the instance unhealthy and fail with
    /// [`GatewayError::UpstreamUnavailable`]. Cancellation and an elapsed caller
    /// deadline leave the instance's health untouched.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        instance: &ServiceInstance,
        request: &OutboundRequest,
    ) -> GatewayResult<Response<Body>> {
        let attempt = OutboundAttempt::start(instance);

        if ctx.is_cancelled() {
            attempt.finish(AttemptOutcome::Cancelled, &self.metrics);
            return Err(GatewayError::Cancelled);
        }

        let remaining = ctx.remaining();
        if remaining.is_zero() {
            attempt.finish(AttemptOutcome::DeadlineExceeded, &self.metrics);
            return Err(deadline_exceeded(ctx));
        }
        let (budget, bounded_by_deadline) = if remaining < self.timeout {
            (remaining, true)
        } else {
            (self.timeout, false)
        };

        let outbound = build_request(ctx, instance, request)?;

        let result = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => {
                attempt.finish(AttemptOutcome::Cancelled, &self.metrics);
                return Err(GatewayError::Cancelled);
            }
            result = tokio::time::timeout(budget, self.send(outbound)) => result,
        };

        match result {
            Ok(Ok(response)) => {
                attempt.finish(AttemptOutcome::Success, &self.metrics);
                Ok(response)
            }
            Ok(Err(reason)) => {
                attempt.finish(AttemptOutcome::ConnectionError, &self.metrics);
                Err(self.unavailable(instance, reason))
            }
            Err(_) if bounded_by_deadline => {
                attempt.finish(AttemptOutcome::DeadlineExceeded, &self.metrics);
                Err(deadline_exceeded(ctx))
            }
            Err(_) => {
                attempt.finish(AttemptOutcome::Timeout, &self.metrics);
                Err(self.unavailable(
                    instance,
                    format!("timed out after {}ms", self.timeout.as_millis()),
                ))
            }
        }
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Body>, String> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let (mut parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| format!("failed to read response body: {}", e))?
            .to_bytes();

        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::from(body)))
    }

    fn unavailable(&self, instance: &ServiceInstance, reason: String) -> GatewayError {
        warn!(
            service = %instance.service_name,
            instance = %instance.authority(),
            reason = %reason,
            "Upstream unavailable, marking instance unhealthy"
        );
        self.registry
            .mark_health(&instance.service_name, &instance.host, instance.port, false);

        GatewayError::UpstreamUnavailable {
            instance: instance.authority(),
            reason,
        }
    }
}

fn deadline_exceeded(ctx: &RequestContext) -> GatewayError {
    GatewayError::DeadlineExceeded {
        elapsed_ms: ctx.elapsed().as_millis() as u64,
    }
}

fn build_request(
    ctx: &RequestContext,
    instance: &ServiceInstance,
    request: &OutboundRequest,
) -> GatewayResult<Request<Full<Bytes>>> {
    let path = if request.path_and_query.starts_with('/') {
        request.path_and_query.clone()
    } else {
        format!("/{}", request.path_and_query)
    };
    let uri = format!("http://{}{}", instance.authority(), path);

    let mut builder = Request::builder().method(request.method.clone()).uri(&uri);

    if let Some(headers) = builder.headers_mut() {
        for (key, value) in request.headers.iter() {
            if !is_hop_by_hop_header(key.as_str()) {
                headers.append(key.clone(), value.clone());
            }
        }

        if let Ok(host) = HeaderValue::from_str(&instance.authority()) {
            headers.insert(HOST, host);
        }
        if let Ok(trace_id) = HeaderValue::from_str(ctx.trace_id()) {
            headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), trace_id);
        }
    }

    builder
        .body(Full::new(request.body.clone()))
        .map_err(|e| GatewayError::InvalidRequest {
            reason: format!("failed to build request for {}: {}", uri, e),
        })
}

/// Check if a header is a hop-by-hop header that should not be forwarded.
///
/// `host` is included because it is always rewritten to the instance address.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

// The response body is re-framed, so connection-level headers do not apply to it
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str() != "host" && is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstanceRegistry;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn spawn_backend() -> u16 {
        let app = Router::new().route(
            "/echo",
            get(|headers: HeaderMap| async move {
                let trace = headers
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (
                    StatusCode::CREATED,
                    [("x-backend", "one"), ("x-seen-trace", trace.as_str())],
                    "hello",
                )
                    .into_response()
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    // Accepts connections and never answers
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

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn client_with(registry: &SharedRegistry, timeout: Duration) -> ForwardingClient {
        ForwardingClient::new(registry.clone(), Arc::new(GatewayMetrics::new()), timeout)
    }

    fn registered(registry: &SharedRegistry, port: u16) -> ServiceInstance {
        let instance = ServiceInstance::new("svc", "127.0.0.1", port);
        registry.register(instance.clone()).unwrap();
        instance
    }

    #[tokio::test]
    async fn test_successful_response_passes_through() {
        let registry = Arc::new(InstanceRegistry::new());
        let instance = registered(&registry, spawn_backend().await);
        let client = client_with(&registry, Duration::from_secs(2));
        let ctx = RequestContext::with_trace_id("trace-42", Duration::from_secs(5));

        let response = client
            .forward(&ctx, &instance, &OutboundRequest::new(Method::GET, "/echo"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-backend"], "one");
        assert_eq!(response.headers()["x-seen-trace"], "trace-42");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_timeout_marks_instance_unhealthy() {
        let registry = Arc::new(InstanceRegistry::new());
        let instance = registered(&registry, spawn_silent_backend().await);
        let client = client_with(&registry, Duration::from_millis(100));
        let ctx = RequestContext::new(Duration::from_secs(5));

        let started = Instant::now();
        let err = client
            .forward(&ctx, &instance, &OutboundRequest::new(Method::GET, "/"))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(1000), "took {:?}", elapsed);
        assert!(!registry.is_healthy(&instance.key()));
    }

    #[tokio::test]
    async fn test_connection_refused_marks_instance_unhealthy() {
        let registry = Arc::new(InstanceRegistry::new());
        let instance = registered(&registry, closed_port().await);
        let client = client_with(&registry, Duration::from_secs(1));
        let ctx = RequestContext::new(Duration::from_secs(5));

        let err = client
            .forward(&ctx, &instance, &OutboundRequest::new(Method::GET, "/"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }));
        assert!(!registry.is_healthy(&instance.key()));
    }

    #[tokio::test]
    async fn test_cancellation_keeps_instance_healthy() {
        let registry = Arc::new(InstanceRegistry::new());
        let instance = registered(&registry, spawn_silent_backend().await);
        let client = client_with(&registry, Duration::from_secs(5));
        let ctx = RequestContext::new(Duration::from_secs(10));

        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = client
            .forward(&ctx, &instance, &OutboundRequest::new(Method::GET, "/"))
            .await
            .unwrap_err();

        assert_eq!(err, GatewayError::Cancelled);
        assert!(registry.is_healthy(&instance.key()));
    }

    #[tokio::test]
    async fn test_caller_deadline_keeps_instance_healthy() {
        let registry = Arc::new(InstanceRegistry::new());
        let instance = registered(&registry, spawn_silent_backend().await);
        let client = client_with(&registry, Duration::from_secs(5));
        let ctx = RequestContext::new(Duration::from_millis(100));

        let err = client
            .forward(&ctx, &instance, &OutboundRequest::new(Method::GET, "/"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::DeadlineExceeded { .. }));
        assert!(registry.is_healthy(&instance.key()));
    }

    #[test]
    fn test_host_header_is_hop_by_hop() {
        assert!(is_hop_by_hop_header("host"));
        assert!(is_hop_by_hop_header("Host"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
    }

    #[test]
    fn test_build_request_rewrites_host_and_trace() {
        let ctx = RequestContext::with_trace_id("trace-1", Duration::from_secs(1));
        let instance = ServiceInstance::new("svc", "10.0.0.1", 8081);
        let mut request = OutboundRequest::new(Method::POST, "users?page=2");
        request.headers.insert(HOST, "gateway.local".parse().unwrap());
        request.headers.insert("connection", "keep-alive".parse().unwrap());
        request.headers.insert("x-custom", "1".parse().unwrap());

        let built = build_request(&ctx, &instance, &request).unwrap();
        assert_eq!(built.uri().to_string(), "http://10.0.0.1:8081/users?page=2");
        assert_eq!(built.headers()[HOST], "10.0.0.1:8081");
        assert_eq!(built.headers()[REQUEST_ID_HEADER], "trace-1");
        assert_eq!(built.headers()["x-custom"], "1");
        assert!(built.headers().get("connection").is_none());
    }
}
