use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum length of an asset identifier.
pub const ASSET_ID_MAX_LEN: usize = 20;

/// A validated request to fetch marine weather for one asset on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherRequest {
    pub asset_id: String,
    /// Opaque reference to the asset entity owned by another service.
    pub asset_ref: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    /// Requested calendar day, already normalized.
    pub date: NaiveDate,
    pub timezone: Option<String>,
}

impl WeatherRequest {
    /// `YYYY-MM-DD` form of the requested day.
    pub fn date_key(&self) -> String {
        format_date(self.date)
    }
}

/// Wire shape of an inbound request, as producers publish it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(rename = "idAsset")]
    pub asset_id: String,
    #[serde(rename = "_idAsset", default, skip_serializing_if = "Option::is_none")]
    pub asset_ref: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Parse a request date into a calendar day.
///
/// Accepts `YYYY-MM-DD`, RFC 3339 timestamps and offset-less ISO timestamps.
/// The day is taken as written; offsets are not converted to UTC first.
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts.date());
        }
    }
    None
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Midnight UTC of `date`, the stored form of the natural-key date.
pub fn date_to_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
}

/// GeoJSON point. Coordinates are `[longitude, latitude]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: [f64; 2],
}

impl GeoPoint {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            kind: "Point".to_string(),
            coordinates: [longitude, latitude],
        }
    }

    pub fn longitude(&self) -> f64 {
        self.coordinates[0]
    }

    pub fn latitude(&self) -> f64 {
        self.coordinates[1]
    }
}

/// Opaque forecast document returned by the weather API.
///
/// Only the `hourly` object is required; everything else passes through as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Forecast(Map<String, Value>);

impl Forecast {
    /// Wrap a decoded document, rejecting anything without an `hourly` object.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err("forecast document is not a JSON object".to_string());
        };
        if !matches!(map.get("hourly"), Some(Value::Object(_))) {
            return Err("forecast document has no `hourly` object".to_string());
        }
        Ok(Self(map))
    }

    pub fn hourly(&self) -> Option<&Map<String, Value>> {
        self.0.get("hourly").and_then(Value::as_object)
    }

    /// Timestamps every hourly series is aligned to.
    pub fn time_axis(&self) -> &[Value] {
        self.hourly()
            .and_then(|h| h.get("time"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Names of the hourly series, excluding the time axis.
    pub fn conditions(&self) -> Vec<String> {
        self.hourly()
            .map(|h| h.keys().filter(|k| *k != "time").cloned().collect())
            .unwrap_or_default()
    }

    pub fn timezone(&self) -> Option<&str> {
        self.0.get("timezone").and_then(Value::as_str)
    }

    pub fn elevation(&self) -> Option<f64> {
        self.0.get("elevation").and_then(Value::as_f64)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Summary derived from the forecast when the record is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub source: String,
    pub api_source: String,
    pub data_type: String,
    pub requested_date: String,
    pub conditions: Vec<String>,
    pub timezone: Option<String>,
    pub elevation: Option<f64>,
}

/// Persisted forecast for one asset on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    #[serde(rename = "idAsset")]
    pub asset_id: String,
    #[serde(rename = "_idAsset", default, skip_serializing_if = "Option::is_none")]
    pub asset_ref: Option<String>,
    pub date: NaiveDate,
    #[serde(rename = "capturedAt")]
    pub captured_at: DateTime<Utc>,
    pub location: GeoPoint,
    pub payload: Forecast,
    pub metadata: RecordMetadata,
}

impl WeatherRecord {
    /// Human-readable natural key, `marine-weather-{asset}-{date}`.
    pub fn key(&self) -> String {
        format!("marine-weather-{}-{}", self.asset_id, format_date(self.date))
    }
}

/// A record together with the identity the store assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    #[serde(flatten)]
    pub record: WeatherRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn date_and_timestamp_forms_collapse_to_same_day() {
        let expected = Some(day(2024, 12, 1));

        assert_eq!(normalize_date("2024-12-01"), expected);
        assert_eq!(normalize_date("2024-12-01T00:00:00Z"), expected);
        assert_eq!(normalize_date("2024-12-01T17:45:12.345Z"), expected);
        assert_eq!(normalize_date("2024-12-01T10:00:00"), expected);
    }

    #[test]
    fn offset_timestamps_keep_the_written_day() {
        assert_eq!(normalize_date("2024-12-01T23:30:00-03:00"), Some(day(2024, 12, 1)));
    }

    #[test]
    fn garbage_dates_are_rejected() {
        assert_eq!(normalize_date("yesterday"), None);
        assert_eq!(normalize_date("2024-13-45"), None);
        assert_eq!(normalize_date(""), None);
    }

    #[test]
    fn request_message_uses_wire_names() {
        let msg: RequestMessage = serde_json::from_value(json!({
            "idAsset": "VESSEL-001",
            "latitude": -23.5505,
            "longitude": -46.6333,
            "date": "2024-12-01"
        }))
        .unwrap();

        assert_eq!(msg.asset_id, "VESSEL-001");
        assert!(msg.asset_ref.is_none());

        let back = serde_json::to_value(&msg).unwrap();
        assert!(back.get("_idAsset").is_none());
        assert!(back.get("timezone").is_none());
    }

    #[test]
    fn forecast_requires_hourly_object() {
        assert!(Forecast::from_value(json!({ "timezone": "GMT" })).is_err());
        assert!(Forecast::from_value(json!({ "hourly": [] })).is_err());
        assert!(Forecast::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn forecast_accessors_read_known_fields() {
        let forecast = Forecast::from_value(json!({
            "timezone": "America/Sao_Paulo",
            "elevation": 0.0,
            "hourly": {
                "time": ["2024-12-01T00:00", "2024-12-01T01:00"],
                "wave_height": [1.2, 1.3],
                "swell_wave_period": [8.0, 8.1]
            }
        }))
        .unwrap();

        assert_eq!(forecast.time_axis().len(), 2);
        let mut conditions = forecast.conditions();
        conditions.sort();
        assert_eq!(conditions, vec!["swell_wave_period", "wave_height"]);
        assert_eq!(forecast.timezone(), Some("America/Sao_Paulo"));
        assert_eq!(forecast.elevation(), Some(0.0));
    }

    #[test]
    fn geo_point_is_longitude_first() {
        let point = GeoPoint::new(-46.6333, -23.5505);
        let value = serde_json::to_value(&point).unwrap();

        assert_eq!(value, json!({ "type": "Point", "coordinates": [-46.6333, -23.5505] }));
        assert_eq!(point.latitude(), -23.5505);
    }
}
