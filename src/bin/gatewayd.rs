//! Gateway Daemon - Routing Core Host
//!
//! Loads the gateway configuration, assembles the routing core, starts the
//! background tasks (health monitor, cache sweeper), and idles until
//! interrupted. A serving layer connects to the running core; this binary
//! exists so the core can be exercised and operated standalone.
//!
//! # Usage
//!
//! ```bash
//! # Start with the default config path
//! gatewayd
//!
//! # Explicit config file
//! gatewayd --config /etc/gateway/gateway.toml
//!
//! # Verbose logging
//! RUST_LOG=debug gatewayd
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use gateway_core::events::ChannelSink;
use gateway_core::provider::{InMemoryDirectory, StaticCredentials};
use gateway_core::{load_config_or_default, Gateway, GatewayEvent};

/// Gateway daemon - reliability and routing core host
#[derive(Parser, Debug)]
#[command(name = "gatewayd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level filter when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = load_config_or_default(args.config.as_deref())
        .context("failed to load gateway configuration")?;
    info!(
        providers = config.providers.len(),
        "configuration loaded"
    );

    let directory = Arc::new(InMemoryDirectory::new(config.providers.clone()));
    let credentials = Arc::new(StaticCredentials::new(config.credentials.clone()));
    let (sink, mut events) = ChannelSink::new();
    let gateway = Gateway::with_events(&config, directory, credentials, Arc::new(sink));

    // Drain operational events into the log
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                GatewayEvent::BreakerTransition {
                    provider,
                    from,
                    to,
                    consecutive_failures,
                } => warn!(
                    %provider,
                    ?from,
                    ?to,
                    consecutive_failures,
                    "breaker transition"
                ),
                GatewayEvent::HealthCheck {
                    provider,
                    status,
                    duration_ms,
                    error,
                } => debug!(
                    %provider,
                    ?status,
                    duration_ms,
                    error = error.as_deref().unwrap_or(""),
                    "health check"
                ),
                GatewayEvent::QueueSaturated { queued, capacity } => {
                    warn!(queued, capacity, "queue saturated, rejecting requests");
                }
                GatewayEvent::CacheEviction { key, expired } => {
                    debug!(%key, expired, "cache eviction");
                }
            }
        }
    });

    // Surface per-provider configuration problems at startup; the daemon
    // still runs, with broken providers reported unhealthy.
    for (provider, issues) in gateway.validate_providers().await {
        for issue in issues {
            warn!(%provider, %issue, "provider configuration issue");
        }
    }

    // Initial probe cycle so health state is populated before the first
    // request; unreachable providers stay unhealthy until they recover.
    for result in gateway.monitor().check_all().await {
        if !result.healthy {
            warn!(
                provider = %result.provider,
                error = result.error.as_deref().unwrap_or("unknown"),
                "provider failed startup probe"
            );
        }
    }

    let background = gateway.spawn_background();
    info!(tasks = background.len(), "gatewayd running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("shutdown signal received, stopping");
    for handle in background {
        handle.abort();
    }
    event_logger.abort();
    Ok(())
}
