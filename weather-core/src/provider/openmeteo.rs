use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

use crate::model::Forecast;

use super::{ForecastQuery, MarineWeatherProvider, ProviderError};

pub const MARINE_API_URL: &str = "https://marine-api.open-meteo.com/v1/marine";

/// Hourly series requested for every forecast.
pub const HOURLY_CONDITIONS: &[&str] = &[
    "wave_height",
    "wave_direction",
    "wave_period",
    "wind_wave_height",
    "wind_wave_direction",
    "wind_wave_period",
    "wind_wave_peak_period",
    "swell_wave_height",
    "swell_wave_direction",
    "swell_wave_period",
    "swell_wave_peak_period",
    "ocean_current_velocity",
    "ocean_current_direction",
];

#[derive(Debug, Clone)]
pub struct OpenMeteoMarineProvider {
    api_url: String,
    api_host: String,
    http: Client,
}

impl OpenMeteoMarineProvider {
    pub fn new(api_url: String, timeout: Duration) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;

        let api_host = reqwest::Url::parse(&api_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| api_url.clone());

        Ok(Self { api_url, api_host, http })
    }

    fn query_params(query: &ForecastQuery) -> Vec<(&'static str, String)> {
        vec![
            ("latitude", query.latitude.to_string()),
            ("longitude", query.longitude.to_string()),
            ("hourly", HOURLY_CONDITIONS.join(",")),
            ("start_date", query.start_date.clone()),
            ("end_date", query.end_date.clone()),
            ("wind_speed_unit", "kn".to_string()),
            ("timezone", query.timezone.clone()),
        ]
    }
}

#[async_trait]
impl MarineWeatherProvider for OpenMeteoMarineProvider {
    fn source(&self) -> &'static str {
        "open-meteo"
    }

    fn api_source(&self) -> &str {
        &self.api_host
    }

    async fn fetch_forecast(&self, query: &ForecastQuery) -> Result<Forecast, ProviderError> {
        debug!(
            latitude = query.latitude,
            longitude = query.longitude,
            start_date = %query.start_date,
            timezone = %query.timezone,
            "Fetching marine weather"
        );

        let res = self
            .http
            .get(&self.api_url)
            .query(&Self::query_params(query))
            .send()
            .await?;

        let status = res.status();
        let body = res.text().await?;

        if !status.is_success() {
            error!(status = status.as_u16(), body = %truncate_body(&body), "Marine weather request failed");
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        parse_forecast(&body)
    }
}

fn parse_forecast(body: &str) -> Result<Forecast, ProviderError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
    Forecast::from_value(value).map_err(ProviderError::Decode)
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> ForecastQuery {
        ForecastQuery {
            latitude: -23.5505,
            longitude: -46.6333,
            start_date: "2024-12-01".into(),
            end_date: "2024-12-01".into(),
            timezone: "America/Sao_Paulo".into(),
        }
    }

    #[test]
    fn query_uses_single_day_range_and_knots() {
        let params = OpenMeteoMarineProvider::query_params(&query());
        let get = |k: &str| {
            params
                .iter()
                .find(|(key, _)| *key == k)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("latitude"), Some("-23.5505"));
        assert_eq!(get("longitude"), Some("-46.6333"));
        assert_eq!(get("start_date"), Some("2024-12-01"));
        assert_eq!(get("end_date"), Some("2024-12-01"));
        assert_eq!(get("wind_speed_unit"), Some("kn"));
        assert_eq!(get("timezone"), Some("America/Sao_Paulo"));

        let hourly = get("hourly").unwrap();
        assert_eq!(hourly.split(',').count(), HOURLY_CONDITIONS.len());
        assert!(hourly.starts_with("wave_height,"));
    }

    #[test]
    fn parses_marine_response() {
        let body = r#"{
            "latitude": -23.5, "longitude": -46.625,
            "generationtime_ms": 0.2, "utc_offset_seconds": -10800,
            "timezone": "America/Sao_Paulo", "timezone_abbreviation": "-03",
            "elevation": 0.0,
            "hourly_units": { "time": "iso8601", "wave_height": "m" },
            "hourly": { "time": ["2024-12-01T00:00"], "wave_height": [1.4] }
        }"#;

        let forecast = parse_forecast(body).expect("valid response");
        assert_eq!(forecast.conditions(), vec!["wave_height"]);
        assert_eq!(forecast.as_map().get("utc_offset_seconds"), Some(&Value::from(-10800)));
    }

    #[test]
    fn response_without_hourly_is_a_decode_error() {
        let err = parse_forecast(r#"{ "error": true, "reason": "nope" }"#).unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));

        let err = parse_forecast("<html>").unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let body = "é".repeat(150);
        let out = truncate_body(&body);

        assert!(out.ends_with("..."));
        assert!(out.len() <= 203);
    }

    #[test]
    fn api_host_is_derived_from_url() {
        let provider =
            OpenMeteoMarineProvider::new(MARINE_API_URL.to_string(), Duration::from_secs(10))
                .unwrap();
        assert_eq!(provider.api_source(), "marine-api.open-meteo.com");
    }
}
