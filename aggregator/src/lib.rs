//! Bucket query engine
//!
//! A [`bucket::Bucket`] runs [`query::Query`] values against a
//! [`storage::Repository`], gap-filling period queries so that every week or
//! month in range is present.

pub mod bucket;
pub mod config;
pub mod error;
pub mod metrics;
pub mod query;
pub mod response;
pub mod storage;

pub use bucket::Bucket;
pub use config::{BucketConfig, BucketDefaults, Settings};
pub use error::{BucketError, Result};
pub use query::{Query, QueryShape, SortBy, SortDirection};
pub use response::{Data, PeriodData, SimpleData};
pub use storage::{memory::InMemoryRepository, Repository, StorageError};
