//! HTTP front end for the weather cache
//!
//! Routes:
//! - `GET /weather?city=NAME` returns the cached or freshly fetched [`WeatherReport`] as JSON
//! - `GET /health` returns `OK`
//!
//! [`run`] wires the upstream client, resolver and background sweep together
//! and serves until the shutdown token is cancelled.

use std::future::IntoFuture;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::{Fetcher, Resolver};
use crate::cli::ServiceConfig;
use crate::data::{WeatherClient, WeatherError, WeatherReport};

/// How long in-flight requests may take to finish after shutdown is requested
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that stop the server
#[derive(Debug, Error)]
pub enum ServerError {
    /// The upstream HTTP client could not be built
    #[error("Failed to build weather client: {0}")]
    Client(#[from] WeatherError),

    /// The listen address could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// The server loop failed
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),

    /// The server task panicked or was aborted
    #[error("Server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// In-flight requests did not finish within [`SHUTDOWN_TIMEOUT`]
    #[error("Graceful shutdown timed out after {0:?}")]
    ShutdownTimedOut(Duration),
}

/// Query string of `GET /weather`
#[derive(Debug, Deserialize)]
pub struct WeatherQuery {
    pub city: Option<String>,
}

/// Builds the router serving weather lookups through `resolver`
pub fn router<F>(resolver: Resolver<F>) -> Router
where
    F: Fetcher<Value = WeatherReport>,
{
    Router::new()
        .route("/weather", get(get_weather::<F>))
        .route("/health", get(health_check))
        .with_state(resolver)
}

async fn get_weather<F>(
    State(resolver): State<Resolver<F>>,
    Query(query): Query<WeatherQuery>,
) -> Response
where
    F: Fetcher<Value = WeatherReport>,
{
    let city = match query.city.as_deref().map(str::trim) {
        Some(city) if !city.is_empty() => city,
        _ => {
            return (StatusCode::BAD_REQUEST, "City parameter is required").into_response();
        }
    };

    match resolver.resolve(city).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            error!(city, error = %err, "Error fetching weather");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch weather data").into_response()
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}

/// Runs the service until `shutdown` is cancelled
///
/// Starts the cache sweep, serves HTTP on `config.server_addr`, and on
/// shutdown gives in-flight requests up to [`SHUTDOWN_TIMEOUT`] to finish
/// before the sweep task is joined.
pub async fn run(config: ServiceConfig, shutdown: CancellationToken) -> Result<(), ServerError> {
    let client = WeatherClient::new(&config.external_api_url, &config.api_key)?;
    let resolver = Resolver::new(client, config.cache_ttl);
    info!(ttl = ?resolver.ttl(), sweep_interval = ?config.sweep_interval, "Weather cache ready");

    let sweep = resolver.start_background_sweep(config.sweep_interval, shutdown.clone());

    let listener = TcpListener::bind(config.server_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.server_addr,
            source,
        })?;
    info!(addr = %config.server_addr, "Starting server");

    let result = serve(listener, router(resolver), shutdown.clone()).await;

    // Stop the sweep even when the server exited on its own
    shutdown.cancel();
    if let Err(err) = sweep.await {
        warn!(error = %err, "Cache sweep task failed");
    }

    if result.is_ok() {
        info!("Server stopped gracefully");
    }
    result
}

async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let signal = shutdown.clone();
    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .into_future(),
    );

    tokio::select! {
        result = &mut server => return Ok(result??),
        _ = shutdown.cancelled() => info!("Shutdown signal received"),
    }

    info!("Shutting down gracefully...");
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server).await {
        Ok(result) => Ok(result??),
        Err(_) => {
            server.abort();
            warn!(timeout = ?SHUTDOWN_TIMEOUT, "Forced shutdown");
            Err(ServerError::ShutdownTimedOut(SHUTDOWN_TIMEOUT))
        }
    }
}
