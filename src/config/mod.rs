//! Configuration module for the gateway service
//!
//! This module handles loading and parsing configuration from TOML files.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Load-balancing policy used to pick an instance of a service
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerPolicy {
    /// Cycle through healthy instances in order
    #[default]
    RoundRobin,
    /// Pick a healthy instance uniformly at random
    Random,
    /// Pick the healthy instance with the fewest in-flight requests
    LeastConnections,
}

impl LoadBalancerPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerPolicy::RoundRobin => "round_robin",
            LoadBalancerPolicy::Random => "random",
            LoadBalancerPolicy::LeastConnections => "least_connections",
        }
    }
}

/// Load balancer and forwarding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Selection policy
    #[serde(default)]
    pub policy: LoadBalancerPolicy,
    /// Maximum number of forwarding attempts per inbound request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Timeout of a single forwarding attempt in milliseconds
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
    /// How long an unhealthy instance is kept before it is pruned, in seconds
    #[serde(default = "default_unhealthy_retention_secs")]
    pub unhealthy_retention_secs: u64,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_forward_timeout_ms() -> u64 {
    3000
}

fn default_unhealthy_retention_secs() -> u64 {
    300
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            policy: LoadBalancerPolicy::default(),
            max_attempts: default_max_attempts(),
            forward_timeout_ms: default_forward_timeout_ms(),
            unhealthy_retention_secs: default_unhealthy_retention_secs(),
        }
    }
}

impl BalancerConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn unhealthy_retention(&self) -> Duration {
        Duration::from_secs(self.unhealthy_retention_secs)
    }
}

/// Route configuration: maps inbound requests to a logical service name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route name (optional, for display purposes)
    #[serde(default)]
    pub name: Option<String>,
    /// Path pattern to match (e.g., "/users/*")
    pub path: String,
    /// Optional Host header to match (port is ignored)
    #[serde(default)]
    pub host: Option<String>,
    /// Logical service name requests are load-balanced across
    pub service: String,
    /// Optional methods to match (if empty, all methods are matched)
    #[serde(default)]
    pub methods: Vec<String>,
    /// Whether to strip the matched prefix from the path
    #[serde(default)]
    pub strip_prefix: bool,
    /// Route description
    pub description: Option<String>,
    /// Whether the route is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A backend instance declared in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,
}

/// A logical service and the instances registered for it at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overall request deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

/// Upper bound on `server.timeout`
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 86_400;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path to expose metrics
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether health check is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path for health check endpoint
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Path for readiness endpoint
    #[serde(default = "default_ready_path")]
    pub ready_path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_ready_path() -> String {
    "/ready".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_health_path(),
            ready_path: default_ready_path(),
        }
    }
}

/// Admin API configuration (registry updates from the health-checking collaborator)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Whether the admin API is mounted
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path prefix of the admin API
    #[serde(default = "default_admin_prefix")]
    pub prefix: String,
    /// Header name to check for the access token
    #[serde(default = "default_admin_header_name")]
    pub header_name: String,
    /// Accepted tokens; when empty the admin API is open
    #[serde(default)]
    pub tokens: Vec<String>,
}

fn default_admin_prefix() -> String {
    "/_gateway".to_string()
}

fn default_admin_header_name() -> String {
    "Authorization".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_admin_prefix(),
            header_name: default_admin_header_name(),
            tokens: vec![],
        }
    }
}

impl AdminConfig {
    /// Validate an incoming token against the configured tokens
    pub fn validate_token(&self, token: Option<&str>) -> bool {
        if self.tokens.is_empty() {
            return true;
        }
        token.is_some_and(|token| self.tokens.iter().any(|t| t == token))
    }
}

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    /// Route mappings, matched in order
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Services with statically known instances
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load configuration from a TOML string
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.timeout == 0 || self.server.timeout > MAX_REQUEST_TIMEOUT_SECS {
            anyhow::bail!(
                "server.timeout must be between 1 and {} seconds",
                MAX_REQUEST_TIMEOUT_SECS
            );
        }
        if self.balancer.max_attempts == 0 {
            anyhow::bail!("balancer.max_attempts must be at least 1");
        }
        if self.balancer.forward_timeout_ms == 0 {
            anyhow::bail!("balancer.forward_timeout_ms must be greater than 0");
        }

        for route in &self.routes {
            if !route.path.starts_with('/') {
                anyhow::bail!("Route path '{}' must start with '/'", route.path);
            }
            if route.service.trim().is_empty() {
                anyhow::bail!("Route '{}' has an empty service name", route.path);
            }
        }

        let mut seen_services = HashSet::new();
        for service in &self.services {
            if !seen_services.insert(service.name.as_str()) {
                anyhow::bail!("Service '{}' is declared more than once", service.name);
            }
            let mut seen_instances = HashSet::new();
            for instance in &service.instances {
                if !seen_instances.insert((instance.host.as_str(), instance.port)) {
                    anyhow::bail!(
                        "Service '{}' declares instance {}:{} more than once",
                        service.name,
                        instance.host,
                        instance.port
                    );
                }
            }
        }

        if self.admin.enabled && !self.admin.prefix.starts_with('/') {
            anyhow::bail!("Admin prefix '{}' must start with '/'", self.admin.prefix);
        }

        Ok(())
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Overall deadline applied to each inbound request
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.server.timeout)
    }
}
