//! Field values and documents
//!
//! A [`Document`] is what repositories store and return. Timestamps may arrive
//! from a repository zone-less or with an offset; [`Value::normalized`] turns
//! every variant into `Timestamp` (UTC) so callers only ever see UTC.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};

use crate::utils::time::{naive_to_utc, offset_to_utc};

/// A stored document: field name to value.
pub type Document = BTreeMap<String, Value>;

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// UTC instant. The only timestamp variant exposed by query results.
    Timestamp(DateTime<Utc>),
    /// Timestamp without zone information, read as UTC.
    NaiveTimestamp(NaiveDateTime),
    /// Timestamp carrying a fixed offset.
    OffsetTimestamp(DateTime<FixedOffset>),
    List(Vec<Value>),
    Document(Document),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The UTC instant of any timestamp variant.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::NaiveTimestamp(naive) => Some(naive_to_utc(naive)),
            Value::OffsetTimestamp(ts) => Some(offset_to_utc(ts)),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn is_timestamp(&self) -> bool {
        self.as_timestamp().is_some()
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Document(_))
    }

    /// Same value with every timestamp, at any depth, converted to UTC.
    pub fn normalized(self) -> Value {
        match self {
            Value::NaiveTimestamp(naive) => Value::Timestamp(naive_to_utc(&naive)),
            Value::OffsetTimestamp(ts) => Value::Timestamp(offset_to_utc(&ts)),
            Value::List(items) => Value::List(items.into_iter().map(Value::normalized).collect()),
            Value::Document(doc) => Value::Document(normalize_document(doc)),
            other => other,
        }
    }

    /// Equality as a filter sees it: timestamps compare as instants and
    /// integers compare equal to floats of the same magnitude.
    pub fn matches(&self, other: &Value) -> bool {
        self.sort_cmp(other) == Ordering::Equal
    }

    /// Total order used when sorting rows by a field.
    ///
    /// Null < bool < number < string < timestamp < list < document.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(a), Value::Float(b)) => cmp_int_float(*a, *b),
            (Value::Float(a), Value::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| x.sort_cmp(y))
                .find(|o| o.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            (Value::Document(a), Value::Document(b)) => a
                .iter()
                .zip(b.iter())
                .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| va.sort_cmp(vb)))
                .find(|o| o.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            _ => match (self.as_timestamp(), other.as_timestamp()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Timestamp(_) | Value::NaiveTimestamp(_) | Value::OffsetTimestamp(_) => 4,
            Value::List(_) => 5,
            Value::Document(_) => 6,
        }
    }

    /// Plain text form used when deriving identifiers from field values.
    pub fn to_key_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Timestamp(_) | Value::NaiveTimestamp(_) | Value::OffsetTimestamp(_) => self
                .as_timestamp()
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_default(),
            Value::List(_) | Value::Document(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

/// Exact ordering of an integer against a float.
///
/// Casting `i` to `f64` would round above 2^53 and make distinct values equal.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    // 2^63, the first float above i64::MAX
    const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() {
        return (i as f64).total_cmp(&f);
    }
    if f >= I64_BOUND {
        return Ordering::Less;
    }
    if f < -I64_BOUND {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    i.cmp(&(whole as i64)).then_with(|| {
        if f > whole {
            Ordering::Less
        } else if f < whole {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    })
}

/// Normalize every timestamp in a document to UTC.
pub fn normalize_document(doc: Document) -> Document {
    doc.into_iter().map(|(k, v)| (k, v.normalized())).collect()
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Timestamp(_) | Value::NaiveTimestamp(_) | Value::OffsetTimestamp(_) => {
                let ts = self.as_timestamp().unwrap_or(DateTime::<Utc>::MIN_UTC);
                serializer.serialize_str(&ts.to_rfc3339())
            }
            Value::List(items) => items.serialize(serializer),
            Value::Document(doc) => doc.serialize(serializer),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Document(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(naive: NaiveDateTime) -> Self {
        Value::NaiveTimestamp(naive)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(ts: DateTime<FixedOffset>) -> Self {
        Value::OffsetTimestamp(ts)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(doc)
    }
}
