//! Time-related utilities
//!
//! Everything stored or returned by a bucket is expressed in UTC. These helpers
//! are the single place where zone-less or offset timestamps become UTC.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::error::ValidationError;

/// Interpret a zone-less timestamp as UTC.
pub fn naive_to_utc(naive: &NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(naive)
}

/// Convert an offset timestamp to the same instant in UTC.
pub fn offset_to_utc(ts: &DateTime<FixedOffset>) -> DateTime<Utc> {
    ts.with_timezone(&Utc)
}

/// 00:00:00 UTC on the given day.
pub fn midnight(date: NaiveDate) -> DateTime<Utc> {
    naive_to_utc(&date.and_time(NaiveTime::MIN))
}

/// Parse an RFC 3339 timestamp (`2013-01-07T00:00:00+00:00`) into UTC.
///
/// A timestamp without an offset (`2013-01-07T00:00:00`) is accepted and read
/// as UTC.
pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(offset_to_utc(&ts));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive_to_utc(&naive))
        .map_err(|_| ValidationError::new(field, format!("'{}' is not an RFC 3339 timestamp", raw)))
}
