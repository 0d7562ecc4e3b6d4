//! # Ecology Node
//!
//! Runs one device of an ecology: its WebSocket connectors, the ecology loop
//! and a small HTTP API over the replicated data.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (no connectors)
//! ecology
//!
//! # Run with a specific config file
//! ECOLOGY_CONFIG=/path/to/ecology.toml ecology
//!
//! # Run with environment variables
//! ECOLOGY_DEVICE_ID=phone ECOLOGY_PORT=8081 ecology
//! ```
//!
//! ## Example configuration
//!
//! ```toml
//! device_id = "hub"
//! is_reference = true
//!
//! [[connectors]]
//! role = "core-server"
//! address = "0.0.0.0:7000"
//!
//! [[rooms]]
//! name = "lobby"
//! events = ["tap"]
//!
//! [data]
//! volume = 7
//! ```

mod config;
mod handlers;
mod json;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ecology=debug,ecology_core=debug,ecology_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        device = %config.device_id,
        reference = config.is_reference,
        connectors = config.connectors.len(),
        "Starting ecology node on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    handlers::run_node(config).await?;

    Ok(())
}
