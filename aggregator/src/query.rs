//! Query value object
//!
//! A [`Query`] describes one read against a bucket. It is built once through
//! [`QueryBuilder`], never mutated, and compares structurally, so two queries
//! built from the same options are equal (`filter_by` order included).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_shared::{Period, ValidationError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl FromStr for SortDirection {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ascending" | "asc" => Ok(SortDirection::Ascending),
            "descending" | "desc" => Ok(SortDirection::Descending),
            _ => Err(ValidationError::new(
                "sort_by",
                format!("'{}' is not one of ascending, descending", s),
            )),
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Ascending => f.write_str("ascending"),
            SortDirection::Descending => f.write_str("descending"),
        }
    }
}

/// Field and direction to sort rows by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    pub direction: SortDirection,
}

impl SortBy {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    pub fn ascending(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Ascending)
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Descending)
    }
}

/// Parses `field:direction`, e.g. `value:descending`.
impl FromStr for SortBy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (field, direction) = s
            .split_once(':')
            .ok_or_else(|| ValidationError::new("sort_by", "expected field:direction"))?;
        Ok(SortBy::new(field, direction.parse()?))
    }
}

/// An immutable read request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    filter_by: Vec<(String, Value)>,
    group_by: Option<String>,
    sort_by: Option<SortBy>,
    limit: Option<u32>,
    collect: Vec<String>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    period: Option<Period>,
}

/// How a bucket executes a query. Every query maps to exactly one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryShape<'a> {
    /// Plain filtered documents.
    Find,
    /// Counts per distinct value of a field.
    Group { group_by: &'a str },
    /// Counts per period, gap-filled.
    PeriodGroup { period: Period },
    /// Counts per field value, each with a gap-filled period series.
    MultiPeriodGroup { group_by: &'a str, period: Period },
}

impl QueryShape<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            QueryShape::Find => "find",
            QueryShape::Group { .. } => "group",
            QueryShape::PeriodGroup { .. } => "period_group",
            QueryShape::MultiPeriodGroup { .. } => "multi_period_group",
        }
    }
}

impl Query {
    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }

    pub fn filter_by(&self) -> &[(String, Value)] {
        &self.filter_by
    }

    pub fn group_by(&self) -> Option<&str> {
        self.group_by.as_deref()
    }

    pub fn sort_by(&self) -> Option<&SortBy> {
        self.sort_by.as_ref()
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn collect(&self) -> &[String] {
        &self.collect
    }

    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        self.start_at
    }

    pub fn end_at(&self) -> Option<DateTime<Utc>> {
        self.end_at
    }

    pub fn period(&self) -> Option<Period> {
        self.period
    }

    /// True when the query asks for unaggregated documents.
    pub fn is_raw(&self) -> bool {
        matches!(self.shape(), QueryShape::Find)
    }

    pub fn shape(&self) -> QueryShape<'_> {
        match (self.group_by.as_deref(), self.period) {
            (None, None) => QueryShape::Find,
            (Some(group_by), None) => QueryShape::Group { group_by },
            (None, Some(period)) => QueryShape::PeriodGroup { period },
            (Some(group_by), Some(period)) => QueryShape::MultiPeriodGroup { group_by, period },
        }
    }
}

/// Collects query options; [`QueryBuilder::build`] validates them.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    filter_by: Vec<(String, Value)>,
    group_by: Option<String>,
    sort_by: Option<SortBy>,
    limit: Option<i64>,
    collect: Vec<String>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    period: Option<Period>,
}

impl QueryBuilder {
    /// Add an equality constraint. Constraints keep their insertion order.
    pub fn filter_by(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter_by.push((key.into(), value.into()));
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }

    pub fn sort_by(mut self, sort: SortBy) -> Self {
        self.sort_by = Some(sort);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn collect(mut self, field: impl Into<String>) -> Self {
        self.collect.push(field.into());
        self
    }

    pub fn start_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn end_at(mut self, end_at: DateTime<Utc>) -> Self {
        self.end_at = Some(end_at);
        self
    }

    pub fn period(mut self, period: Period) -> Self {
        self.period = Some(period);
        self
    }

    pub fn build(self) -> Result<Query, ValidationError> {
        let limit = match self.limit {
            None => None,
            Some(n) if n > 0 => Some(u32::try_from(n).map_err(|_| {
                ValidationError::new("limit", format!("{} exceeds {}", n, u32::MAX))
            })?),
            Some(n) => {
                return Err(ValidationError::new(
                    "limit",
                    format!("must be a positive integer, got {}", n),
                ))
            }
        };

        if self.group_by.as_deref().is_some_and(str::is_empty) {
            return Err(ValidationError::new("group_by", "field name is empty"));
        }
        if self.sort_by.as_ref().is_some_and(|s| s.field.is_empty()) {
            return Err(ValidationError::new("sort_by", "field name is empty"));
        }
        if self.collect.iter().any(String::is_empty) {
            return Err(ValidationError::new("collect", "field name is empty"));
        }
        if self.filter_by.iter().any(|(key, _)| key.is_empty()) {
            return Err(ValidationError::new("filter_by", "field name is empty"));
        }

        Ok(Query {
            filter_by: self.filter_by,
            group_by: self.group_by,
            sort_by: self.sort_by,
            limit,
            collect: self.collect,
            start_at: self.start_at,
            end_at: self.end_at,
            period: self.period,
        })
    }
}
