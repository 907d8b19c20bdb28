//! Shared fixtures for unit tests.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::{
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::model::{Forecast, GeoPoint, RecordMetadata, WeatherRecord, WeatherRequest, normalize_date};
use crate::provider::{ForecastQuery, MarineWeatherProvider, ProviderError};

/// A small but realistic marine forecast document.
pub fn sample_forecast() -> Forecast {
    Forecast::from_value(json!({
        "latitude": -23.5,
        "longitude": -46.625,
        "generationtime_ms": 0.31,
        "utc_offset_seconds": -10800,
        "timezone": "America/Sao_Paulo",
        "timezone_abbreviation": "-03",
        "elevation": 0.0,
        "hourly_units": { "time": "iso8601", "wave_height": "m", "wave_direction": "°" },
        "hourly": {
            "time": ["2024-12-01T00:00", "2024-12-01T01:00", "2024-12-01T02:00"],
            "wave_height": [1.42, 1.46, 1.5],
            "wave_direction": [131, 132, 134]
        }
    }))
    .expect("fixture forecast is well formed")
}

pub fn sample_request(asset_id: &str, date: &str) -> WeatherRequest {
    WeatherRequest {
        asset_id: asset_id.to_string(),
        asset_ref: None,
        latitude: -23.5505,
        longitude: -46.6333,
        date: normalize_date(date).expect("fixture date parses"),
        timezone: Some("America/Sao_Paulo".to_string()),
    }
}

pub fn record(asset_id: &str, date: NaiveDate, longitude: f64, latitude: f64) -> WeatherRecord {
    let payload = sample_forecast();
    WeatherRecord {
        asset_id: asset_id.to_string(),
        asset_ref: None,
        date,
        captured_at: Utc::now(),
        location: GeoPoint::new(longitude, latitude),
        metadata: RecordMetadata {
            source: "stub".to_string(),
            api_source: "stub.local".to_string(),
            data_type: "marine_weather_conditions".to_string(),
            requested_date: date.format("%Y-%m-%d").to_string(),
            conditions: payload.conditions(),
            timezone: payload.timezone().map(str::to_string),
            elevation: payload.elevation(),
        },
        payload,
    }
}

type ErrorFactory = Box<dyn Fn() -> ProviderError + Send + Sync>;

/// Provider that records every query and answers from a script.
pub struct StubProvider {
    failure: Option<ErrorFactory>,
    /// Fail only the first `fail_times` calls, then succeed.
    fail_times: Option<usize>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    queries: Mutex<Vec<ForecastQuery>>,
}

impl StubProvider {
    pub fn ok() -> Self {
        Self {
            failure: None,
            fail_times: None,
            delay: None,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: impl Fn() -> ProviderError + Send + Sync + 'static) -> Self {
        Self {
            failure: Some(Box::new(error)),
            ..Self::ok()
        }
    }

    pub fn failing_times(
        times: usize,
        error: impl Fn() -> ProviderError + Send + Sync + 'static,
    ) -> Self {
        Self {
            fail_times: Some(times),
            ..Self::failing(error)
        }
    }

    /// Hold every fetch for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queries(&self) -> Vec<ForecastQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubProvider").field("calls", &self.calls()).finish()
    }
}

#[async_trait]
impl MarineWeatherProvider for StubProvider {
    fn source(&self) -> &'static str {
        "stub"
    }

    fn api_source(&self) -> &str {
        "stub.local"
    }

    async fn fetch_forecast(&self, query: &ForecastQuery) -> Result<Forecast, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.failure {
            Some(error) if self.fail_times.is_none_or(|times| call < times) => Err(error()),
            _ => Ok(sample_forecast()),
        }
    }
}
