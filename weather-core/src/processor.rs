use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::{
    model::{Forecast, GeoPoint, RecordMetadata, WeatherRecord, WeatherRequest},
    provider::{ForecastQuery, MarineWeatherProvider, ProviderError},
    store::{RecordStore, StoreError, UpsertOutcome},
};

/// Stored in `metadata.dataType` of every record.
pub const DATA_TYPE: &str = "marine_weather_conditions";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Turns a validated request into a stored record: fetch, build, upsert.
///
/// Failures are not retried here; retry is a queue-level decision.
pub struct IngestionProcessor {
    provider: Arc<dyn MarineWeatherProvider>,
    store: Arc<dyn RecordStore>,
    default_timezone: String,
}

impl IngestionProcessor {
    pub fn new(
        provider: Arc<dyn MarineWeatherProvider>,
        store: Arc<dyn RecordStore>,
        default_timezone: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            store,
            default_timezone: default_timezone.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn process_and_store(
        &self,
        request: &WeatherRequest,
    ) -> Result<UpsertOutcome, ProcessError> {
        let date = request.date_key();
        info!(
            asset_id = %request.asset_id,
            date = %date,
            latitude = request.latitude,
            longitude = request.longitude,
            "Processing marine weather request"
        );

        let query = ForecastQuery {
            latitude: request.latitude,
            longitude: request.longitude,
            start_date: date.clone(),
            end_date: date.clone(),
            timezone: request
                .timezone
                .clone()
                .unwrap_or_else(|| self.default_timezone.clone()),
        };

        let forecast = self.provider.fetch_forecast(&query).await.map_err(|e| {
            error!(asset_id = %request.asset_id, date = %date, error = %e, "Marine weather fetch failed");
            e
        })?;

        let record = self.build_record(request, forecast, Utc::now());
        let outcome = self.store.upsert(&record).await.map_err(|e| {
            error!(asset_id = %request.asset_id, date = %date, error = %e, "Marine weather upsert failed");
            e
        })?;

        info!(
            asset_id = %request.asset_id,
            date = %date,
            inserted = matches!(outcome, UpsertOutcome::Inserted { .. }),
            "Marine weather data saved"
        );
        Ok(outcome)
    }

    fn build_record(
        &self,
        request: &WeatherRequest,
        forecast: Forecast,
        captured_at: DateTime<Utc>,
    ) -> WeatherRecord {
        let metadata = RecordMetadata {
            source: self.provider.source().to_string(),
            api_source: self.provider.api_source().to_string(),
            data_type: DATA_TYPE.to_string(),
            requested_date: request.date_key(),
            conditions: forecast.conditions(),
            timezone: forecast.timezone().map(str::to_string),
            elevation: forecast.elevation(),
        };

        WeatherRecord {
            asset_id: request.asset_id.clone(),
            asset_ref: request.asset_ref.clone(),
            date: request.date,
            captured_at,
            location: GeoPoint::new(request.longitude, request.latitude),
            payload: forecast,
            metadata,
        }
    }
}
