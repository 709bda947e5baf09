//! Errors surfaced by bucket operations

use tally_shared::ValidationError;
use thiserror::Error;

use crate::storage::StorageError;

pub type Result<T, E = BucketError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BucketError {
    /// Malformed configuration or query input.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Stored data violates an invariant the engine relies on (e.g. a period
    /// marker that is not on a period boundary). Never retried or repaired.
    #[error("bucket '{bucket}' holds inconsistent data in '{field}': {details}")]
    Consistency {
        bucket: String,
        field: String,
        details: String,
    },

    #[error("storage failure in bucket '{bucket}': {source}")]
    Storage {
        bucket: String,
        #[source]
        source: StorageError,
    },
}

impl BucketError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Consistency { .. } => "consistency",
            Self::Storage { .. } => "storage",
        }
    }
}
