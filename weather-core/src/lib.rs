//! Core library for the marine weather ingestion service.
//!
//! Requests arrive on a RabbitMQ fanout exchange, are validated, enriched with
//! an hourly marine forecast from Open-Meteo and upserted into MongoDB, one
//! record per asset and day.
//!
//! This crate defines:
//! - Configuration (file, then environment)
//! - Request validation and the stored record model
//! - The forecast provider, record store and broker connection seams
//! - The ingestion processor and the consumer loop that drives it
//!
//! It is used by `marine-weather-cli`, but the pieces can be wired into other
//! binaries as well.

pub mod config;
pub mod consumer;
pub mod model;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod store;
pub mod validate;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::Config;
pub use consumer::{ConsumerLoop, ConsumerSettings, MessageError, RetryPolicy};
pub use model::{StoredRecord, WeatherRecord, WeatherRequest};
pub use processor::{IngestionProcessor, ProcessError};
pub use provider::{MarineWeatherProvider, OpenMeteoMarineProvider, ProviderError};
pub use queue::{AmqpConnection, ConnectionError, ConnectionState, QueueConnection};
pub use store::{MongoRecordStore, RecordStore, StoreError};
pub use validate::{ValidationError, validate};
