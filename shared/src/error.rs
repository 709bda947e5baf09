//! Caller-facing validation errors

use thiserror::Error;

/// Malformed input to a constructor (bucket names, query options, records).
///
/// Recoverable by correcting the input; never used for stored-data faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
