//! Query result wrappers
//!
//! Results are normalized to UTC once, when they are built, and handed out as
//! shared read-only slices so a cached result cannot be altered by a caller.
//!
//! ```compile_fail
//! use tally_aggregator::response::SimpleData;
//! use tally_shared::Document;
//!
//! let data = SimpleData::new(vec![Document::new()]);
//! data.data().push(Document::new());
//! ```

use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tally_shared::{normalize_document, Document};

/// Rows returned by find and field-group queries.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleData {
    rows: Arc<[Document]>,
}

/// Rows returned by period and field × period queries.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodData {
    rows: Arc<[Document]>,
}

/// Result of [`crate::bucket::Bucket::query`].
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Simple(SimpleData),
    Period(PeriodData),
}

fn normalize(rows: Vec<Document>) -> Arc<[Document]> {
    rows.into_iter().map(normalize_document).collect()
}

impl SimpleData {
    pub fn new(rows: Vec<Document>) -> Self {
        Self { rows: normalize(rows) }
    }

    pub fn data(&self) -> &[Document] {
        &self.rows
    }
}

impl PeriodData {
    pub fn new(rows: Vec<Document>) -> Self {
        Self { rows: normalize(rows) }
    }

    pub fn data(&self) -> &[Document] {
        &self.rows
    }
}

impl Data {
    pub fn data(&self) -> &[Document] {
        match self {
            Data::Simple(simple) => simple.data(),
            Data::Period(period) => period.data(),
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn is_period(&self) -> bool {
        matches!(self, Data::Period(_))
    }
}

impl From<SimpleData> for Data {
    fn from(data: SimpleData) -> Self {
        Data::Simple(data)
    }
}

impl From<PeriodData> for Data {
    fn from(data: PeriodData) -> Self {
        Data::Period(data)
    }
}

fn serialize_rows<S: Serializer>(rows: &[Document], serializer: S) -> Result<S::Ok, S::Error> {
    let mut state = serializer.serialize_struct("Data", 1)?;
    state.serialize_field("data", rows)?;
    state.end()
}

impl Serialize for SimpleData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_rows(self.data(), serializer)
    }
}

impl Serialize for PeriodData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_rows(self.data(), serializer)
    }
}

impl Serialize for Data {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_rows(self.data(), serializer)
    }
}
