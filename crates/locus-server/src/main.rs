//! # Locus Daemon
//!
//! Fused location service over HTTP and WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! locusd
//!
//! # Run with custom config
//! locusd --config /path/to/locus.toml
//!
//! # Run with environment variables
//! LOCUS_PORT=8080 LOCUS_HOST=0.0.0.0 LOCUS_ENGINE__MAX_REQUESTS=500 locusd
//! ```

mod config;
mod handlers;
mod link;
mod metrics;
mod replay;

use anyhow::{bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "locusd=debug,locus_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut args = std::env::args().skip(1);
    let config = match (args.next().as_deref(), args.next()) {
        (None, _) => config::Config::load()?,
        (Some("--config"), Some(path)) => config::Config::from_file(path)?,
        (Some(arg), _) => bail!("Unexpected argument: {arg}"),
    };

    tracing::info!("Starting Locus daemon on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
