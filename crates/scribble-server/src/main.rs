//! # Scribble Server
//!
//! Realtime shared whiteboard server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! scribble
//!
//! # Run with custom config
//! SCRIBBLE_CONFIG=/path/to/scribble.toml scribble
//!
//! # Run with environment variables
//! SCRIBBLE_PORT=8080 SCRIBBLE__STORAGE__BACKEND=memory scribble
//!
//! # Print the effective configuration and exit
//! scribble --print-config
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scribble=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    if std::env::args().any(|arg| arg == "--print-config") {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!(
        storage = ?config.storage.backend,
        "Starting Scribble server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
