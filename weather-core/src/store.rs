use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::model::{StoredRecord, WeatherRecord};

pub mod memory;
pub mod mongo;

pub use memory::MemoryRecordStore;
pub use mongo::MongoRecordStore;

/// Default page size for read queries.
pub const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Default search radius for location queries, in meters.
pub const DEFAULT_MAX_DISTANCE_M: f64 = 10_000.0;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to record store: {0}")]
    Connect(String),

    #[error("record store operation `{operation}` failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },

    #[error("stored document is malformed: {0}")]
    Corrupt(String),
}

/// Result of writing a record by natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed for the key; a new identity was assigned.
    Inserted { id: String },
    /// An existing record was replaced in place, keeping its identity.
    Replaced,
}

/// Records of one asset, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetQuery {
    pub asset_id: Option<String>,
    pub asset_ref: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: u32,
}

impl Default for AssetQuery {
    fn default() -> Self {
        Self {
            asset_id: None,
            asset_ref: None,
            from: None,
            to: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

/// Records near a point, nearest first.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationQuery {
    pub longitude: f64,
    pub latitude: f64,
    pub max_distance_m: f64,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: u32,
}

impl LocationQuery {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
            max_distance_m: DEFAULT_MAX_DISTANCE_M,
            from: None,
            to: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

/// Document store for weather records, keyed by `(asset_id, date)`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert the record, or fully replace the one stored under the same
    /// `(asset_id, date)`, as one atomic write.
    async fn upsert(&self, record: &WeatherRecord) -> Result<UpsertOutcome, StoreError>;

    async fn find_by_key(
        &self,
        asset_id: &str,
        date: NaiveDate,
    ) -> Result<Option<StoredRecord>, StoreError>;

    async fn find_by_asset(&self, query: &AssetQuery) -> Result<Vec<StoredRecord>, StoreError>;

    async fn find_near(&self, query: &LocationQuery) -> Result<Vec<StoredRecord>, StoreError>;

    async fn find_latest(&self, asset_id: &str) -> Result<Option<StoredRecord>, StoreError>;

    async fn count_by_asset(&self, asset_id: &str) -> Result<u64, StoreError>;

    /// Release the underlying connection.
    async fn close(&self);
}
