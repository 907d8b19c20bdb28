//! In-process record store for local runs and tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use super::{AssetQuery, LocationQuery, RecordStore, StoreError, UpsertOutcome};
use crate::model::{GeoPoint, StoredRecord, WeatherRecord};

const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<(String, NaiveDate), StoredRecord>,
    next_id: u64,
    writes: u64,
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<State>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all assets.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of upserts applied so far.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-write; the map is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(&self, record: &WeatherRecord) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.lock();
        state.writes += 1;
        let key = (record.asset_id.clone(), record.date);

        if let Some(existing) = state.records.get_mut(&key) {
            existing.record = record.clone();
            return Ok(UpsertOutcome::Replaced);
        }

        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        state.records.insert(
            key,
            StoredRecord {
                id: id.clone(),
                record: record.clone(),
            },
        );
        Ok(UpsertOutcome::Inserted { id })
    }

    async fn find_by_key(
        &self,
        asset_id: &str,
        date: NaiveDate,
    ) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self
            .lock()
            .records
            .get(&(asset_id.to_string(), date))
            .cloned())
    }

    async fn find_by_asset(&self, query: &AssetQuery) -> Result<Vec<StoredRecord>, StoreError> {
        let state = self.lock();
        let mut found: Vec<StoredRecord> = state
            .records
            .values()
            .filter(|s| {
                query.asset_id.as_deref().is_none_or(|id| s.record.asset_id == id)
                    && query
                        .asset_ref
                        .as_deref()
                        .is_none_or(|r| s.record.asset_ref.as_deref() == Some(r))
                    && in_range(s.record.date, query.from, query.to)
            })
            .cloned()
            .collect();

        found.sort_by(|a, b| b.record.date.cmp(&a.record.date));
        found.truncate(query.limit as usize);
        Ok(found)
    }

    async fn find_near(&self, query: &LocationQuery) -> Result<Vec<StoredRecord>, StoreError> {
        let origin = GeoPoint::new(query.longitude, query.latitude);
        let state = self.lock();

        let mut found: Vec<(f64, StoredRecord)> = state
            .records
            .values()
            .filter(|s| in_range(s.record.date, query.from, query.to))
            .map(|s| (distance_m(&origin, &s.record.location), s.clone()))
            .filter(|(d, _)| *d <= query.max_distance_m)
            .collect();

        found.sort_by(|a, b| a.0.total_cmp(&b.0));
        found.truncate(query.limit as usize);
        Ok(found.into_iter().map(|(_, s)| s).collect())
    }

    async fn find_latest(&self, asset_id: &str) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|s| s.record.asset_id == asset_id)
            .max_by_key(|s| s.record.date)
            .cloned())
    }

    async fn count_by_asset(&self, asset_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .records
            .keys()
            .filter(|(id, _)| id == asset_id)
            .count() as u64)
    }

    async fn close(&self) {}
}

fn in_range(date: NaiveDate, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    from.is_none_or(|from| date >= from) && to.is_none_or(|to| date <= to)
}

/// Great-circle distance between two points.
fn distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let (lat1, lat2) = (a.latitude().to_radians(), b.latitude().to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.longitude() - a.longitude()).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}
