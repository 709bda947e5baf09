//! Calendar periods and their boundary arithmetic
//!
//! A period instance is the half-open UTC interval `[start, end)` where `end` is
//! the start of the following period. Weeks start on Monday 00:00 UTC, months
//! on the 1st at 00:00 UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;
use crate::utils::time::midnight;

/// Reserved record field holding the day a record falls in.
pub const DAY_START_FIELD: &str = "_day_start_at";

/// A calendar period a query can group by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Week,
    Month,
}

/// One `[start, end)` step of a period sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeriodSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A stored period marker that is not on a period boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{value} is not the start of a {period}")]
pub struct Misaligned {
    pub period: Period,
    pub value: DateTime<Utc>,
}

impl Period {
    /// Reserved record field holding the period start for this kind.
    pub fn field_name(self) -> &'static str {
        match self {
            Period::Week => "_week_start_at",
            Period::Month => "_month_start_at",
        }
    }

    /// Floor `ts` to the start of the week or month containing it.
    ///
    /// Saturates at the earliest representable instant.
    pub fn start_of(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.checked_start_of(ts).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Like [`Period::start_of`], but `None` when the start would fall before
    /// the earliest representable date.
    pub fn checked_start_of(self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = ts.date_naive();
        let days_back = match self {
            Period::Week => date.weekday().num_days_from_monday(),
            Period::Month => date.day0(),
        };
        date.checked_sub_signed(Duration::days(i64::from(days_back)))
            .map(midnight)
    }

    /// Start of the period immediately following the one starting at `start`.
    ///
    /// Saturates at the largest representable instant.
    pub fn next_start(self, start: DateTime<Utc>) -> DateTime<Utc> {
        let first = self.start_of(start);
        let next = match self {
            Period::Week => first.checked_add_signed(Duration::days(7)),
            Period::Month => first
                .date_naive()
                .checked_add_months(Months::new(1))
                .map(midnight),
        };
        next.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_aligned(self, ts: DateTime<Utc>) -> bool {
        self.checked_start_of(ts) == Some(ts)
    }

    /// Reject a stored period start that is not already on a boundary.
    pub fn validate_alignment(self, start: DateTime<Utc>) -> Result<(), Misaligned> {
        if self.is_aligned(start) {
            Ok(())
        } else {
            Err(Misaligned {
                period: self,
                value: start,
            })
        }
    }

    /// The span starting at the (already aligned) `start`.
    pub fn span(self, start: DateTime<Utc>) -> PeriodSpan {
        PeriodSpan {
            start,
            end: self.next_start(start),
        }
    }

    /// Every period overlapping `[start_of(start_at), end_at)`, in order.
    pub fn enumerate(self, start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> PeriodRange {
        PeriodRange {
            period: self,
            next: Some(self.start_of(start_at)),
            end_at,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Week => f.write_str("week"),
            Period::Month => f.write_str("month"),
        }
    }
}

impl FromStr for Period {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            _ => Err(ValidationError::new(
                "period",
                format!("'{}' is not one of week, month", s),
            )),
        }
    }
}

/// Lazy sequence of consecutive periods. Cloning restarts from the clone point.
#[derive(Debug, Clone)]
pub struct PeriodRange {
    period: Period,
    next: Option<DateTime<Utc>>,
    end_at: DateTime<Utc>,
}

impl Iterator for PeriodRange {
    type Item = PeriodSpan;

    fn next(&mut self) -> Option<PeriodSpan> {
        let start = self.next.filter(|start| *start < self.end_at)?;
        let span = self.period.span(start);
        // A saturated successor cannot advance; stop instead of repeating.
        self.next = (span.end > start).then_some(span.end);
        Some(span)
    }
}
