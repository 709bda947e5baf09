//! Storage backends
//!
//! The engine only sees [`Repository`]; how documents are persisted is up to
//! the implementation.

pub mod memory;

use tally_shared::Document;
use thiserror::Error;

use crate::query::{Query, SortBy};

/// Reserved field holding the number of documents in a group.
pub const GROUP_COUNT_FIELD: &str = "_group_count";
/// Reserved field holding the nested per-period rows of a multi-group row.
pub const SUBGROUP_FIELD: &str = "_subgroup";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Find and aggregation primitives a bucket is executed against.
///
/// Every method must honor the query's `filter_by` constraints and its
/// `[start_at, end_at)` range on `_timestamp`; callers do not re-filter.
pub trait Repository: Send + Sync {
    /// Persist one document. Idempotency is not guaranteed.
    fn save(&self, document: &Document) -> Result<(), StorageError>;

    /// Filtered, sorted and limited documents, unaggregated.
    fn find(
        &self,
        query: &Query,
        sort: Option<&SortBy>,
        limit: Option<u32>,
    ) -> Result<Vec<Document>, StorageError>;

    /// One row per distinct value of `key`: `{key: value, _count, ...collect}`.
    fn group(
        &self,
        key: &str,
        query: &Query,
        sort: Option<&SortBy>,
        limit: Option<u32>,
        collect: &[String],
    ) -> Result<Vec<Document>, StorageError>;

    /// One row per distinct value of `group_key`, each nesting its counts per
    /// `period_key` value:
    /// `{group_key: value, _count, _group_count, _subgroup: [{period_key, _count}]}`.
    fn multi_group(
        &self,
        group_key: &str,
        period_key: &str,
        query: &Query,
        sort: Option<&SortBy>,
        limit: Option<u32>,
        collect: &[String],
    ) -> Result<Vec<Document>, StorageError>;
}
