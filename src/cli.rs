//! Command-line and environment configuration for the weather cache service
//!
//! Every option can be given as a flag or through its environment variable.
//! Durations use a compact form such as `3m`, `100ms` or `1h30m`. A cache TTL
//! or sweep interval that is unparseable or zero falls back to its default, so
//! a typo can never produce an always-expired or never-expiring cache.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::warn;

use crate::cache::{DEFAULT_CACHE_TTL, DEFAULT_SWEEP_INTERVAL};
use crate::data::DEFAULT_API_URL;

/// Error types for configuration parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The value is not a duration like "90s", "3m" or "1h30m"
    #[error("Invalid duration: '{0}'. Expected a number followed by ms, s, m or h (e.g. 3m, 1h30m)")]
    InvalidDuration(String),

    /// No upstream API URL was configured
    #[error("External API URL must not be empty")]
    MissingApiUrl,
}

/// Weather Cache - serve current weather with a coalescing in-memory cache
#[derive(Parser, Debug)]
#[command(name = "weather-cache")]
#[command(about = "Weather lookup service with a request-coalescing, time-expiring cache")]
#[command(version)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "SERVER_ADDR", default_value = "0.0.0.0:8080")]
    pub server_addr: SocketAddr,

    /// How long a fetched report stays fresh (e.g. 90s, 3m, 1h)
    #[arg(long, env = "CACHE_TTL", default_value = "3m")]
    pub cache_ttl: String,

    /// How often expired entries are swept from memory
    #[arg(long, env = "CACHE_SWEEP_INTERVAL", default_value = "1m")]
    pub sweep_interval: String,

    /// Base URL of the OpenWeatherMap-compatible upstream API
    #[arg(long, env = "EXTERNAL_API_URL", default_value = DEFAULT_API_URL)]
    pub external_api_url: String,

    /// API key sent to the upstream as `appid`
    #[arg(long, env = "API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Validated settings the service starts with
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub server_addr: SocketAddr,
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub external_api_url: String,
    pub api_key: String,
}

impl ServiceConfig {
    /// Creates a ServiceConfig from parsed CLI arguments.
    ///
    /// # Returns
    /// * `Ok(ServiceConfig)` with durations resolved, defaults substituted where invalid
    /// * `Err(CliError::MissingApiUrl)` if the upstream URL is blank
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let external_api_url = cli.external_api_url.trim();
        if external_api_url.is_empty() {
            return Err(CliError::MissingApiUrl);
        }

        Ok(ServiceConfig {
            server_addr: cli.server_addr,
            cache_ttl: duration_or_default("cache TTL", &cli.cache_ttl, DEFAULT_CACHE_TTL),
            sweep_interval: duration_or_default(
                "sweep interval",
                &cli.sweep_interval,
                DEFAULT_SWEEP_INTERVAL,
            ),
            external_api_url: external_api_url.to_string(),
            api_key: cli.api_key.clone(),
        })
    }
}

/// Parses `value`, substituting `default` when it is invalid or zero
pub fn duration_or_default(name: &str, value: &str, default: Duration) -> Duration {
    match parse_duration(value) {
        Ok(duration) if !duration.is_zero() => duration,
        Ok(_) => {
            warn!(setting = name, value, ?default, "Duration must be positive, using default");
            default
        }
        Err(err) => {
            warn!(setting = name, error = %err, ?default, "Using default duration");
            default
        }
    }
}

/// Parses a duration such as "30s", "5m", "1h30m" or "250ms".
///
/// Each segment is a non-negative decimal number followed by one of the units
/// `ms`, `s`, `m` or `h`; segments are summed.
pub fn parse_duration(s: &str) -> Result<Duration, CliError> {
    let invalid = || CliError::InvalidDuration(s.to_string());

    let mut rest = s.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos = 0.0_f64;
    while !rest.is_empty() {
        // Find where the number ends and unit begins
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let (num_str, tail) = rest.split_at(num_end);
        let num: f64 = num_str.parse().map_err(|_| invalid())?;

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);

        let unit_nanos = match unit {
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 60.0 * 60.0 * 1e9,
            _ => return Err(invalid()),
        };

        total_nanos += num * unit_nanos;
        rest = tail;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
