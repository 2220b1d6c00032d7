//! Metrics module for Prometheus
//!
//! This module provides metrics collection for the gateway service:
//! - Request count by method, service, and status
//! - Request latency histogram
//! - Outbound attempts by outcome, and retries
//! - In-flight requests gauge per service

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tracing::warn;

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    request_counter: CounterVec,
    request_latency: HistogramVec,
    attempt_counter: CounterVec,
    attempt_latency: HistogramVec,
    retry_counter: CounterVec,
    active_requests: GaugeVec,
}

impl GatewayMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_counter = CounterVec::new(
            Opts::new("gateway_requests_total", "Total number of inbound requests"),
            &["method", "service", "status"],
        )
        .expect("Failed to create request counter");

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_latency_seconds",
                "Inbound request latency in seconds",
            )
            .buckets(latency_buckets()),
            &["method", "service"],
        )
        .expect("Failed to create latency histogram");

        let attempt_counter = CounterVec::new(
            Opts::new(
                "gateway_upstream_attempts_total",
                "Total number of outbound attempts by outcome",
            ),
            &["service", "outcome"],
        )
        .expect("Failed to create attempt counter");

        let attempt_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_upstream_latency_seconds",
                "Outbound attempt latency in seconds",
            )
            .buckets(latency_buckets()),
            &["service"],
        )
        .expect("Failed to create attempt latency histogram");

        let retry_counter = CounterVec::new(
            Opts::new("gateway_retries_total", "Total number of re-selections after a failed attempt"),
            &["service"],
        )
        .expect("Failed to create retry counter");

        let active_requests = GaugeVec::new(
            Opts::new("gateway_active_requests", "Number of in-flight requests"),
            &["service"],
        )
        .expect("Failed to create active requests gauge");

        registry
            .register(Box::new(request_counter.clone()))
            .expect("Failed to register request counter");
        registry
            .register(Box::new(request_latency.clone()))
            .expect("Failed to register latency histogram");
        registry
            .register(Box::new(attempt_counter.clone()))
            .expect("Failed to register attempt counter");
        registry
            .register(Box::new(attempt_latency.clone()))
            .expect("Failed to register attempt latency histogram");
        registry
            .register(Box::new(retry_counter.clone()))
            .expect("Failed to register retry counter");
        registry
            .register(Box::new(active_requests.clone()))
            .expect("Failed to register active requests gauge");

        Self {
            registry,
            request_counter,
            request_latency,
            attempt_counter,
            attempt_latency,
            retry_counter,
            active_requests,
        }
    }

    /// Record an inbound request with its status and latency
    pub fn record_request(&self, method: &str, service: &str, status: u16, latency: Duration) {
        let status_str = status.to_string();

        self.request_counter
            .with_label_values(&[method, service, &status_str])
            .inc();

        self.request_latency
            .with_label_values(&[method, service])
            .observe(latency.as_secs_f64());
    }

    /// Record one outbound attempt
    pub fn record_attempt(&self, service: &str, outcome: &str, latency: Duration) {
        self.attempt_counter
            .with_label_values(&[service, outcome])
            .inc();
        self.attempt_latency
            .with_label_values(&[service])
            .observe(latency.as_secs_f64());
    }

    pub fn record_retry(&self, service: &str) {
        self.retry_counter.with_label_values(&[service]).inc();
    }

    pub fn inc_active_requests(&self, service: &str) {
        self.active_requests.with_label_values(&[service]).inc();
    }

    pub fn dec_active_requests(&self, service: &str) {
        self.active_requests.with_label_values(&[service]).dec();
    }

    /// Get the Prometheus metrics output
    pub fn prometheus_output(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}
