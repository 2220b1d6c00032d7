//! Balanced Gateway - a load-balanced reverse-proxy gateway
//!
//! This gateway provides:
//! - An instance registry of backend endpoints per logical service, with health state
//! - Load balancing across healthy instances (round robin, random, least connections)
//! - Forwarding with per-attempt timeouts and retry on another instance
//! - An admin API for registering instances and reporting their health
//! - Prometheus metrics
//! - Liveness and readiness checks

pub mod admin;
pub mod balancer;
pub mod config;
pub mod context;
pub mod error;
pub mod forward;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use server::Gateway;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
