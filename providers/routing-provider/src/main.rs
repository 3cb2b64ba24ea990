//! # Routing wasmCloud Provider Binary
//!
//! Entry point for the notification routing capability provider.
//!
//! Uses wasmCloud provider runtime for lifecycle management.

use anyhow::{Context, Result};
use tracing::{error, info};
use wasmcloud_provider_sdk::{load_host_data, run_provider};

use routing_provider::{ProviderConfig, RoutingProvider};

/// Main entry point for wasmCloud provider binary
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with environment filter
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routing_provider=info".parse()?)
                .add_directive("notification_router=info".parse()?),
        )
        .init();

    info!("Starting Routing Provider for wasmCloud");

    let host_data = load_host_data().context("Failed to load wasmCloud host data")?;

    info!("Provider ID: {}", host_data.provider_key);
    info!("Config entries: {}", host_data.config.len());

    let config = if !host_data.config.is_empty() {
        info!("Using configuration from wasmCloud HostData");
        ProviderConfig::from_properties(&host_data.config)
            .context("Failed to load routing configuration from host data")?
    } else {
        info!("Falling back to environment variables");
        ProviderConfig::from_env().context("Failed to load routing configuration")?
    };

    info!("Configuration:");
    info!("  NATS URL: {}", config.nats_url);
    info!("  Redis URL: {}", config.redis_url);
    info!("  Store timeout: {}ms", config.store_timeout_ms);
    info!("  Max concurrent requests: {}", config.max_concurrent_requests);

    let provider = RoutingProvider::from_config(config)
        .await
        .context("Failed to create routing provider")?;

    info!("Provider ready - waiting for routing requests");
    let runtime_provider = provider.clone();
    tokio::spawn(async move {
        if let Err(e) = provider.run().await {
            error!("Provider error: {}", e);
        }
    });

    let handler = run_provider(runtime_provider, "routing-provider")
        .await
        .context("Provider runtime error")?;
    handler.await;

    info!("Routing Provider shutdown complete");
    Ok(())
}
