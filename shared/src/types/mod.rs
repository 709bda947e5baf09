//! Data types stored in and returned from buckets

pub mod record;
pub mod value;
