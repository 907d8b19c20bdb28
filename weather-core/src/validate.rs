//! Shape checks for inbound request payloads.
//!
//! Every violation is collected before failing so a producer sees the whole
//! list in one log line, not one field per redelivery.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::model::{ASSET_ID_MAX_LEN, WeatherRequest, normalize_date};

/// One malformed or missing field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid weather request: {}", join(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn fields(&self) -> Vec<&'static str> {
        self.violations.iter().map(|v| v.field).collect()
    }
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check a decoded message body and turn it into a typed request.
pub fn validate(body: &Value) -> Result<WeatherRequest, ValidationError> {
    let Some(obj) = body.as_object() else {
        return Err(ValidationError {
            violations: vec![Violation {
                field: "payload",
                message: "expected a JSON object".to_string(),
            }],
        });
    };

    let mut violations = Vec::new();

    let asset_id = required_str(obj, "idAsset", &mut violations).and_then(|id| {
        if id.trim().is_empty() {
            push(&mut violations, "idAsset", "must not be empty");
            None
        } else if id.chars().count() > ASSET_ID_MAX_LEN {
            push(
                &mut violations,
                "idAsset",
                format!("must be at most {ASSET_ID_MAX_LEN} characters"),
            );
            None
        } else {
            Some(id.to_string())
        }
    });

    let asset_ref = optional_str(obj, "_idAsset", &mut violations);
    let latitude = coordinate(obj, "latitude", 90.0, &mut violations);
    let longitude = coordinate(obj, "longitude", 180.0, &mut violations);

    let date = required_str(obj, "date", &mut violations).and_then(|raw| {
        let parsed = normalize_date(raw);
        if parsed.is_none() {
            push(
                &mut violations,
                "date",
                format!("'{raw}' is not an ISO-8601 or YYYY-MM-DD date"),
            );
        }
        parsed
    });

    let timezone = optional_str(obj, "timezone", &mut violations).filter(|tz| !tz.is_empty());

    match (asset_id, latitude, longitude, date) {
        (Some(asset_id), Some(latitude), Some(longitude), Some(date)) if violations.is_empty() => {
            Ok(WeatherRequest {
                asset_id,
                asset_ref,
                latitude,
                longitude,
                date,
                timezone,
            })
        }
        _ => Err(ValidationError { violations }),
    }
}

fn push(violations: &mut Vec<Violation>, field: &'static str, message: impl Into<String>) {
    violations.push(Violation {
        field,
        message: message.into(),
    });
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
    violations: &mut Vec<Violation>,
) -> Option<&'a str> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            push(violations, field, "is required");
            None
        }
        Some(Value::String(s)) => Some(s.as_str()),
        Some(other) => {
            push(violations, field, format!("expected a string, got {}", kind(other)));
            None
        }
    }
}

fn optional_str(
    obj: &Map<String, Value>,
    field: &'static str,
    violations: &mut Vec<Violation>,
) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            push(violations, field, format!("expected a string, got {}", kind(other)));
            None
        }
    }
}

fn coordinate(
    obj: &Map<String, Value>,
    field: &'static str,
    bound: f64,
    violations: &mut Vec<Violation>,
) -> Option<f64> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            push(violations, field, "is required");
            None
        }
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() && v.abs() <= bound => Some(v),
            Some(v) if v.is_finite() => {
                push(violations, field, format!("{v} is outside [-{bound}, {bound}]"));
                None
            }
            _ => {
                push(violations, field, "must be a finite number");
                None
            }
        },
        Some(other) => {
            push(violations, field, format!("expected a number, got {}", kind(other)));
            None
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
