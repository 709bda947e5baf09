//! Shared types and utilities for Tally
//!
//! This crate contains the value model stored in buckets, record helpers used
//! by ingestion, and the calendar arithmetic behind period queries.

pub mod error;
pub mod timeseries;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::ValidationError;
pub use timeseries::{Period, PeriodRange, PeriodSpan};
pub use types::{record::*, value::*};
