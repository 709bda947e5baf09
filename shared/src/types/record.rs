//! Records: one stored fact in a bucket
//!
//! A record is a document whose reserved fields start with `_`. The helpers
//! here belong to the ingestion path; a bucket stores records exactly as given.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};

use crate::error::ValidationError;
use crate::timeseries::{Period, DAY_START_FIELD};
use crate::types::value::{Document, Value};
use crate::utils::time::{midnight, parse_timestamp};

pub const TIMESTAMP_FIELD: &str = "_timestamp";
pub const ID_FIELD: &str = "_id";
pub const START_AT_FIELD: &str = "_start_at";
pub const END_AT_FIELD: &str = "_end_at";
pub const COUNT_FIELD: &str = "_count";

/// Reserved fields a client may set on an incoming record.
pub const RESERVED_KEYWORDS: &[&str] = &[TIMESTAMP_FIELD, START_AT_FIELD, END_AT_FIELD, ID_FIELD];

/// Reserved fields parsed as timestamps when a record is read from JSON.
const TIMESTAMP_KEYWORDS: &[&str] = &[TIMESTAMP_FIELD, START_AT_FIELD, END_AT_FIELD];

static VALID_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_.\-]+$").unwrap());

/// One stored fact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    data: Document,
}

impl Record {
    pub fn new(data: Document) -> Self {
        Self { data }
    }

    /// Build a record from a JSON object, parsing reserved timestamp fields.
    pub fn from_json(json: serde_json::Value) -> Result<Self, ValidationError> {
        let serde_json::Value::Object(map) = json else {
            return Err(ValidationError::new("record", "expected a JSON object"));
        };

        let mut data = Document::new();
        for (key, value) in map {
            let value = match value {
                serde_json::Value::String(raw) if TIMESTAMP_KEYWORDS.contains(&key.as_str()) => {
                    Value::Timestamp(parse_timestamp(&key, &raw)?)
                }
                other => Value::from(other),
            };
            data.insert(key, value);
        }
        Ok(Self { data })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn data(&self) -> &Document {
        &self.data
    }

    pub fn into_document(self) -> Document {
        self.data
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.get(TIMESTAMP_FIELD).and_then(Value::as_timestamp)
    }

    /// Check field names and values against what a bucket accepts.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (key, value) in &self.data {
            if !key_is_valid(key) {
                return Err(ValidationError::new(key.as_str(), "not a valid field name"));
            }
            if !value.is_scalar() {
                return Err(ValidationError::new(key.as_str(), "nested values are not accepted"));
            }
        }
        if let Some(ts) = self.get(TIMESTAMP_FIELD) {
            if !ts.is_timestamp() {
                return Err(ValidationError::new(TIMESTAMP_FIELD, "must be a timestamp"));
            }
        }
        Ok(())
    }

    /// Add the day, week and month start fields derived from `_timestamp`.
    ///
    /// Records without a `_timestamp` are returned unchanged.
    pub fn with_period_fields(mut self) -> Self {
        if let Some(ts) = self.timestamp() {
            self.data
                .insert(DAY_START_FIELD.to_string(), Value::Timestamp(midnight(ts.date_naive())));
            for period in [Period::Week, Period::Month] {
                self.data
                    .insert(period.field_name().to_string(), Value::Timestamp(period.start_of(ts)));
            }
        }
        self
    }

    /// Set `_id` from the values of `keys`, so re-sending a record overwrites it.
    pub fn with_auto_id(mut self, keys: &[String]) -> Result<Self, ValidationError> {
        let mut parts = Vec::with_capacity(keys.len());
        for key in keys {
            let value = self.get(key).ok_or_else(|| {
                ValidationError::new(key.as_str(), "required to derive the record id")
            })?;
            parts.push(value.to_key_string());
        }
        let id = URL_SAFE_NO_PAD.encode(parts.join("."));
        self.data.insert(ID_FIELD.to_string(), Value::String(id));
        Ok(self)
    }
}

/// Reserved names must match exactly; other keys are case-insensitive.
fn key_is_valid(key: &str) -> bool {
    if key.starts_with('_') {
        RESERVED_KEYWORDS.contains(&key)
    } else {
        VALID_KEY.is_match(&key.to_lowercase())
    }
}

impl From<Document> for Record {
    fn from(data: Document) -> Self {
        Self::new(data)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}
