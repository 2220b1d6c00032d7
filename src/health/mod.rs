//! Health check module
//!
//! This module provides health check functionality for the gateway service:
//! - Basic liveness check
//! - Readiness check derived from the healthy instances of every routed service

use crate::registry::SharedRegistry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health of one routed service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceHealth {
    pub service: String,
    pub healthy_instances: usize,
    pub total_instances: usize,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceHealth>,
}

/// Health checker service
#[derive(Clone)]
pub struct HealthChecker {
    start_time: Instant,
    draining: Arc<AtomicBool>,
    version: String,
    registry: SharedRegistry,
    services: Arc<Vec<String>>,
}

impl HealthChecker {
    /// Create a health checker reporting on the given routed services
    pub fn new(registry: SharedRegistry, mut services: Vec<String>) -> Self {
        services.sort();
        services.dedup();
        Self {
            start_time: Instant::now(),
            draining: Arc::new(AtomicBool::new(false)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            registry,
            services: Arc::new(services),
        }
    }

    /// Get liveness status (always healthy if the service is running)
    pub fn liveness(&self) -> HealthResponse {
        HealthResponse {
            status: HealthStatus::Healthy,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            message: None,
            services: vec![],
        }
    }

    /// Get readiness status.
    ///
    /// Ready when every routed service has a healthy instance, degraded when
    /// only some do, and unhealthy when none do or the gateway is draining.
    pub fn readiness(&self) -> HealthResponse {
        let services: Vec<ServiceHealth> = self
            .services
            .iter()
            .map(|name| ServiceHealth {
                service: name.clone(),
                healthy_instances: self.registry.healthy_count(name),
                total_instances: self.registry.instances(name).len(),
            })
            .collect();

        let available = services.iter().filter(|s| s.healthy_instances > 0).count();

        let (status, message) = if self.is_draining() {
            (
                HealthStatus::Unhealthy,
                Some("Gateway is shutting down".to_string()),
            )
        } else if available == services.len() {
            (HealthStatus::Healthy, None)
        } else if available == 0 {
            (
                HealthStatus::Unhealthy,
                Some("No routed service has a healthy instance".to_string()),
            )
        } else {
            (
                HealthStatus::Degraded,
                Some(format!(
                    "{} of {} services have a healthy instance",
                    available,
                    services.len()
                )),
            )
        };

        HealthResponse {
            status,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            message,
            services,
        }
    }

    /// Mark the gateway as draining; readiness reports unhealthy from then on
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
