//! Weather data model and upstream client
//!
//! [`WeatherReport`] is both the value cached per city and the JSON body
//! returned by `GET /weather`.

pub mod weather;

pub use weather::{WeatherClient, WeatherError, DEFAULT_API_URL};

use serde::{Deserialize, Serialize};

/// Current weather for a city
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    /// City name as reported by the upstream
    pub city: String,
    /// Temperature in Celsius
    pub temperature: f64,
    /// Human-readable conditions, e.g. "clear sky"
    pub description: String,
    /// Observation time as Unix seconds
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_field_names() {
        let report = WeatherReport {
            city: "Tokyo".to_string(),
            temperature: 20.0,
            description: "Cloudy".to_string(),
            timestamp: 1_700_000_000,
        };

        let json: serde_json::Value = serde_json::to_value(&report).expect("Failed to serialize");

        assert_eq!(json["city"], "Tokyo");
        assert_eq!(json["temperature"], 20.0);
        assert_eq!(json["description"], "Cloudy");
        assert_eq!(json["timestamp"], 1_700_000_000);
    }
}
