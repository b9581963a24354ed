//! OpenWeatherMap API client
//!
//! This module fetches current conditions for a city from an
//! OpenWeatherMap-compatible API and parses them into a [`WeatherReport`].
//! The client is the upstream [`Fetcher`] behind the weather cache.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::WeatherReport;
use crate::cache::Fetcher;

/// Base URL for the OpenWeatherMap API
pub const DEFAULT_API_URL: &str = "https://api.openweathermap.org/data/2.5";

/// Upper bound on a single upstream request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when fetching weather data
#[derive(Debug, Error)]
pub enum WeatherError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The upstream does not know the requested city
    #[error("City not found: {0}")]
    CityNotFound(String),

    /// The upstream answered with a non-success status
    #[error("Unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// Failed to parse JSON response
    #[error("Failed to parse JSON response: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Missing expected field in response
    #[error("Missing expected field in response: {0}")]
    MissingField(String),
}

/// Client for fetching current weather by city name
#[derive(Debug, Clone)]
pub struct WeatherClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl WeatherClient {
    /// Create a new WeatherClient with a 10 second request timeout
    ///
    /// # Arguments
    /// * `base_url` - API root, e.g. [`DEFAULT_API_URL`]
    /// * `api_key` - Sent as the `appid` query parameter when non-empty
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, WeatherError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, base_url, api_key))
    }

    /// Create a new WeatherClient with a custom HTTP client
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Fetch current weather for the given city
    ///
    /// # Arguments
    /// * `city` - City name as understood by the upstream (e.g. "Paris")
    ///
    /// # Returns
    /// * `Ok(WeatherReport)` - Current conditions for the city
    /// * `Err(WeatherError)` - If the request, status, or parsing fails
    pub async fn fetch_weather(&self, city: &str) -> Result<WeatherReport, WeatherError> {
        let url = format!("{}/weather", self.base_url.trim_end_matches('/'));

        let mut request = self
            .client
            .get(&url)
            .query(&[("q", city), ("units", "metric")]);
        if !self.api_key.is_empty() {
            request = request.query(&[("appid", self.api_key.as_str())]);
        }

        debug!(city, url = %url, "Requesting upstream weather");
        let response = request.send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(WeatherError::CityNotFound(city.to_string()));
        }
        if !status.is_success() {
            return Err(WeatherError::UnexpectedStatus(status.as_u16()));
        }

        let text = response.text().await?;
        let api_response: OpenWeatherResponse = serde_json::from_str(&text)?;

        parse_response(city, api_response)
    }
}

#[async_trait]
impl Fetcher for WeatherClient {
    type Value = WeatherReport;
    type Error = WeatherError;

    async fn fetch(&self, key: &str) -> Result<WeatherReport, WeatherError> {
        self.fetch_weather(key).await
    }
}

/// Parse the OpenWeatherMap response into a WeatherReport
///
/// The upstream's canonical city name is preferred over the requested one, and
/// the observation time falls back to now when the response omits it.
fn parse_response(
    requested_city: &str,
    response: OpenWeatherResponse,
) -> Result<WeatherReport, WeatherError> {
    let description = response
        .weather
        .into_iter()
        .next()
        .map(|condition| condition.description)
        .ok_or_else(|| WeatherError::MissingField("weather".to_string()))?;

    let city = response
        .name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| requested_city.to_string());

    Ok(WeatherReport {
        city,
        temperature: response.main.temp,
        description,
        timestamp: response.dt.unwrap_or_else(|| Utc::now().timestamp()),
    })
}

/// OpenWeatherMap current weather response
#[derive(Debug, Deserialize)]
struct OpenWeatherResponse {
    name: Option<String>,
    main: MainReadings,
    weather: Vec<WeatherCondition>,
    dt: Option<i64>,
}

/// Temperature block of the response
#[derive(Debug, Deserialize)]
struct MainReadings {
    temp: f64,
}

/// One entry of the `weather` array
#[derive(Debug, Deserialize)]
struct WeatherCondition {
    description: String,
}
