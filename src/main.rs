//! Balanced Gateway - CLI Application
//!
//! A load-balanced reverse-proxy gateway with:
//! - Route and service configuration via TOML
//! - Health-aware load balancing with retries
//! - Admin API for instance registration
//! - Prometheus metrics

use balanced_gateway::{config::GatewayConfig, Gateway};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Balanced Gateway - A load-balanced reverse-proxy gateway
#[derive(Parser)]
#[command(name = "balanced-gateway")]
#[command(version, about = "A load-balanced reverse-proxy gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_server(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::Init { output } => generate_sample_config(&output)?,
    }

    Ok(())
}

/// Start the gateway server
async fn start_server(config_path: &str) -> anyhow::Result<()> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = GatewayConfig::from_file(config_path)?;
    info!("Loaded configuration from {}", config_path);

    let addr: SocketAddr = config.server_addr().parse()?;
    let gateway = Gateway::new(config)?;

    if gateway.config().health.enabled {
        info!("Health endpoint enabled at {}", gateway.config().health.path);
    }
    if gateway.config().metrics.enabled {
        info!("Metrics endpoint enabled at {}", gateway.config().metrics.path);
    }
    if gateway.config().admin.enabled {
        info!("Admin API enabled at {}", gateway.config().admin.prefix);
        if gateway.config().admin.tokens.is_empty() {
            warn!("Admin API has no tokens configured and accepts every request");
        }
    }
    info!(
        "Load balancing policy: {}",
        gateway.config().balancer.policy.as_str()
    );

    let shutdown = gateway.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    gateway.serve(listener).await
}

/// Validate configuration file
fn validate_config(config_path: &str) -> anyhow::Result<()> {
    match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid!");
            println!();
            println!("Server: {}:{}", config.server.host, config.server.port);
            println!(
                "Balancer: {} (max attempts {}, timeout {}ms)",
                config.balancer.policy.as_str(),
                config.balancer.max_attempts,
                config.balancer.forward_timeout_ms
            );
            println!("Routes: {}", config.routes.len());
            println!("Services: {}", config.services.len());
            println!();
            println!("Routes:");
            for route in &config.routes {
                let status = if route.enabled { "✓" } else { "✗" };
                println!("  {} {} → {}", status, route.path, route.service);
            }
            println!();
            println!("Services:");
            for service in &config.services {
                println!("  {} ({} instances)", service.name, service.instances.len());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &str) -> anyhow::Result<()> {
    let sample_config = r#"# Balanced Gateway Configuration

[server]
host = "0.0.0.0"
port = 8080
timeout = 30

[balancer]
policy = "round_robin"  # Options: round_robin, random, least_connections
max_attempts = 2
forward_timeout_ms = 3000
unhealthy_retention_secs = 300

[metrics]
enabled = true
path = "/metrics"

[health]
enabled = true
path = "/health"
ready_path = "/ready"

[admin]
enabled = true
prefix = "/_gateway"
header_name = "Authorization"
tokens = ["change-me"]

# Route configurations
[[routes]]
name = "users"
path = "/users/*"
service = "users"
methods = ["GET", "POST", "PUT", "DELETE"]
description = "User service"
enabled = true

[[routes]]
name = "orders"
path = "/api/orders/*"
service = "orders"
strip_prefix = true
description = "Order service, prefix stripped"
enabled = true

# Statically known instances (more can be registered through the admin API)
[[services]]
name = "users"
instances = [
    { host = "127.0.0.1", port = 3001 },
    { host = "127.0.0.1", port = 3002 },
]

[[services]]
name = "orders"
instances = [
    { host = "127.0.0.1", port = 3003 },
]
"#;

    std::fs::write(output_path, sample_config)?;
    println!("Sample configuration written to {}", output_path);
    Ok(())
}
