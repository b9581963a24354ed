//! Weather Cache - serve current weather for a city over HTTP
//!
//! Lookups go through an in-memory cache that keeps each report fresh for a
//! configurable TTL and collapses concurrent misses into one upstream request.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weather_cache::cli::{Cli, ServiceConfig};
use weather_cache::server;

/// Cancels `shutdown` on Ctrl-C or SIGTERM
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    error!(error = %err, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        info!("Received shutdown signal");
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("weather_cache={},info", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_cli(&cli)?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    if let Err(err) = server::run(config, shutdown).await {
        error!(error = %err, "Application failed");
        return Err(err.into());
    }

    Ok(())
}
