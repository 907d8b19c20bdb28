//! MongoDB record store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mongodb::bson::{self, Bson, Document, doc, oid::ObjectId};
use mongodb::options::{ClientOptions, Credential, FindOneOptions, FindOptions, ReplaceOptions};
use mongodb::{Client, Collection, IndexModel};
use tracing::{info, warn};

use super::{AssetQuery, LocationQuery, RecordStore, StoreError, UpsertOutcome};
use crate::config::StoreConfig;
use crate::model::{
    Forecast, GeoPoint, RecordMetadata, StoredRecord, WeatherRecord, date_to_midnight,
};

/// MongoDB implementation of RecordStore.
pub struct MongoRecordStore {
    client: Client,
    records: Collection<Document>,
}

impl MongoRecordStore {
    /// Connect, select the collection and make sure its indexes exist.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        if let Some((user, password)) = config.credentials() {
            options.credential = Some(
                Credential::builder()
                    .username(user.to_string())
                    .password(password.to_string())
                    .build(),
            );
        }

        let client = Client::with_options(options).map_err(|e| StoreError::Connect(e.to_string()))?;
        let database = client.database(&config.database);

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        let store = Self {
            records: database.collection(&config.collection),
            client,
        };
        store.init().await?;

        info!(
            database = %config.database,
            collection = %config.collection,
            "Connected to MongoDB"
        );
        Ok(store)
    }

    /// Initialize indexes for the read queries.
    async fn init(&self) -> Result<(), StoreError> {
        let indexes = [
            doc! { "idAsset": 1, "date": -1 },
            doc! { "_idAsset": 1, "date": -1 },
            doc! { "location": "2dsphere" },
        ];

        for keys in indexes {
            self.records
                .create_index(IndexModel::builder().keys(keys).build())
                .await
                .map_err(op("create_index"))?;
        }
        Ok(())
    }

    async fn find_many(
        &self,
        filter: Document,
        options: Option<FindOptions>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let mut cursor = self
            .records
            .find(filter)
            .with_options(options)
            .await
            .map_err(op("find"))?;

        let mut found = Vec::new();
        while cursor.advance().await.map_err(op("find"))? {
            let doc = cursor.deserialize_current().map_err(op("find"))?;
            found.push(from_document(&doc)?);
        }
        Ok(found)
    }
}

#[async_trait]
impl RecordStore for MongoRecordStore {
    async fn upsert(&self, record: &WeatherRecord) -> Result<UpsertOutcome, StoreError> {
        let filter = key_filter(&record.asset_id, record.date);
        let replacement = to_document(record)?;
        let options = ReplaceOptions::builder().upsert(true).build();

        let result = self
            .records
            .replace_one(filter, replacement)
            .with_options(options)
            .await
            .map_err(op("upsert"))?;

        Ok(match result.upserted_id {
            Some(id) => UpsertOutcome::Inserted { id: bson_id(&id) },
            None => UpsertOutcome::Replaced,
        })
    }

    async fn find_by_key(
        &self,
        asset_id: &str,
        date: NaiveDate,
    ) -> Result<Option<StoredRecord>, StoreError> {
        self.records
            .find_one(key_filter(asset_id, date))
            .await
            .map_err(op("find_by_key"))?
            .map(|doc| from_document(&doc))
            .transpose()
    }

    async fn find_by_asset(&self, query: &AssetQuery) -> Result<Vec<StoredRecord>, StoreError> {
        let mut filter = Document::new();
        if let Some(asset_id) = &query.asset_id {
            filter.insert("idAsset", asset_id.as_str());
        }
        if let Some(asset_ref) = &query.asset_ref {
            filter.insert("_idAsset", asset_ref_bson(asset_ref));
        }
        if let Some(range) = date_range(query.from, query.to) {
            filter.insert("date", range);
        }

        let options = FindOptions::builder()
            .sort(doc! { "date": -1 })
            .limit(i64::from(query.limit))
            .build();

        self.find_many(filter, Some(options)).await
    }

    async fn find_near(&self, query: &LocationQuery) -> Result<Vec<StoredRecord>, StoreError> {
        let mut filter = doc! {
            "location": {
                "$near": {
                    "$geometry": {
                        "type": "Point",
                        "coordinates": [query.longitude, query.latitude],
                    },
                    "$maxDistance": query.max_distance_m,
                }
            }
        };
        if let Some(range) = date_range(query.from, query.to) {
            filter.insert("date", range);
        }

        let options = FindOptions::builder().limit(i64::from(query.limit)).build();
        self.find_many(filter, Some(options)).await
    }

    async fn find_latest(&self, asset_id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let options = FindOneOptions::builder().sort(doc! { "date": -1 }).build();

        self.records
            .find_one(doc! { "idAsset": asset_id })
            .with_options(options)
            .await
            .map_err(op("find_latest"))?
            .map(|doc| from_document(&doc))
            .transpose()
    }

    async fn count_by_asset(&self, asset_id: &str) -> Result<u64, StoreError> {
        self.records
            .count_documents(doc! { "idAsset": asset_id })
            .await
            .map_err(op("count_by_asset"))
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
        info!("MongoDB connection closed");
    }
}

fn op<E: std::fmt::Display>(operation: &'static str) -> impl Fn(E) -> StoreError {
    move |e| StoreError::Operation {
        operation,
        reason: e.to_string(),
    }
}

fn to_bson_datetime(ts: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(ts.timestamp_millis())
}

fn from_bson_datetime(ts: &bson::DateTime) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ts.timestamp_millis())
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ts} is out of range")))
}

fn key_filter(asset_id: &str, date: NaiveDate) -> Document {
    doc! {
        "idAsset": asset_id,
        "date": to_bson_datetime(date_to_midnight(date)),
    }
}

fn date_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<Document> {
    if from.is_none() && to.is_none() {
        return None;
    }
    let mut range = Document::new();
    if let Some(from) = from {
        range.insert("$gte", to_bson_datetime(date_to_midnight(from)));
    }
    if let Some(to) = to {
        range.insert("$lte", to_bson_datetime(date_to_midnight(to)));
    }
    Some(range)
}

/// Asset references that look like ObjectIds are stored as such so they can be
/// joined against the asset collection.
fn asset_ref_bson(asset_ref: &str) -> Bson {
    match ObjectId::parse_str(asset_ref) {
        Ok(oid) => Bson::ObjectId(oid),
        Err(_) => Bson::String(asset_ref.to_string()),
    }
}

fn bson_id(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_document(record: &WeatherRecord) -> Result<Document, StoreError> {
    let payload = bson::to_bson(&record.payload).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let metadata =
        bson::to_bson(&record.metadata).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let mut doc = doc! {
        "key": record.key(),
        "idAsset": record.asset_id.as_str(),
        "date": to_bson_datetime(date_to_midnight(record.date)),
        "capturedAt": to_bson_datetime(record.captured_at),
        "location": {
            "type": record.location.kind.as_str(),
            "coordinates": [record.location.longitude(), record.location.latitude()],
        },
        "payload": payload,
        "metadata": metadata,
    };
    if let Some(asset_ref) = &record.asset_ref {
        doc.insert("_idAsset", asset_ref_bson(asset_ref));
    }
    Ok(doc)
}

fn from_document(doc: &Document) -> Result<StoredRecord, StoreError> {
    let corrupt = |field: &str, e: bson::document::ValueAccessError| {
        StoreError::Corrupt(format!("field `{field}`: {e}"))
    };

    let id = doc.get("_id").map(bson_id).unwrap_or_default();
    let asset_id = doc.get_str("idAsset").map_err(|e| corrupt("idAsset", e))?.to_string();
    let asset_ref = doc.get("_idAsset").and_then(|v| match v {
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        Bson::String(s) => Some(s.clone()),
        _ => None,
    });

    let date = from_bson_datetime(doc.get_datetime("date").map_err(|e| corrupt("date", e))?)?
        .date_naive();
    let captured_at =
        from_bson_datetime(doc.get_datetime("capturedAt").map_err(|e| corrupt("capturedAt", e))?)?;

    let location = doc.get_document("location").map_err(|e| corrupt("location", e))?;
    let coordinates = location
        .get_array("coordinates")
        .map_err(|e| corrupt("location.coordinates", e))?;
    let (longitude, latitude) = match coordinates.as_slice() {
        [lon, lat] => (lon.as_f64(), lat.as_f64()),
        _ => (None, None),
    };
    let (Some(longitude), Some(latitude)) = (longitude, latitude) else {
        return Err(StoreError::Corrupt(format!(
            "record {id} has malformed coordinates"
        )));
    };

    let payload = doc
        .get("payload")
        .cloned()
        .ok_or_else(|| StoreError::Corrupt(format!("record {id} has no payload")))?
        .into_relaxed_extjson();
    let payload = Forecast::from_value(payload).map_err(StoreError::Corrupt)?;

    let metadata: RecordMetadata = match doc.get("metadata") {
        Some(meta) => bson::from_bson(meta.clone()).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        None => {
            warn!(id = %id, "Stored record has no metadata; deriving from payload");
            RecordMetadata {
                source: String::new(),
                api_source: String::new(),
                data_type: String::new(),
                requested_date: crate::model::format_date(date),
                conditions: payload.conditions(),
                timezone: payload.timezone().map(str::to_string),
                elevation: payload.elevation(),
            }
        }
    };

    Ok(StoredRecord {
        id,
        record: WeatherRecord {
            asset_id,
            asset_ref,
            date,
            captured_at,
            location: GeoPoint::new(longitude, latitude),
            payload,
            metadata,
        },
    })
}
