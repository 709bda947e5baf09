//! Bucket: executes queries against a repository
//!
//! Find and field-group queries are passed straight through. Period queries
//! are checked for boundary alignment and gap-filled, so every period in the
//! requested range appears exactly once, in order, with a zero count when the
//! repository returned nothing for it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_shared::{Document, Period, Record, Value, COUNT_FIELD, END_AT_FIELD, START_AT_FIELD};
use tracing::{debug, error, warn};

use crate::config::BucketConfig;
use crate::error::{BucketError, Result};
use crate::metrics;
use crate::query::{Query, QueryShape, SortBy};
use crate::response::{Data, PeriodData, SimpleData};
use crate::storage::{Repository, StorageError, SUBGROUP_FIELD};

/// Field holding the period series of one group in a field × period result.
pub const VALUES_FIELD: &str = "values";

/// A named collection bound to the repository holding its records.
#[derive(Clone)]
pub struct Bucket {
    config: BucketConfig,
    repository: Arc<dyn Repository>,
}

/// One validated raw period row.
struct PeriodCount {
    start: DateTime<Utc>,
    count: i64,
    /// Remaining raw fields (collected values), carried into the entry.
    extra: Document,
}

impl Bucket {
    pub fn new(config: BucketConfig, repository: Arc<dyn Repository>) -> Self {
        Self { config, repository }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Persist one record exactly as given.
    pub fn store(&self, record: &Record) -> Result<()> {
        self.repository
            .save(record.data())
            .map_err(|e| self.storage_error(e))?;
        metrics::RECORDS_STORED.inc();
        Ok(())
    }

    /// Persist records in order. Stops at the first rejected write.
    pub fn store_all(&self, records: &[Record]) -> Result<()> {
        for record in records {
            self.store(record)?;
        }
        debug!(bucket = %self.name(), records = records.len(), "stored records");
        Ok(())
    }

    pub fn query(&self, query: &Query) -> Result<Data> {
        let shape = query.shape();
        let timer = metrics::QUERY_DURATION.start_timer();
        metrics::QUERIES_TOTAL.with_label_values(&[shape.label()]).inc();
        debug!(bucket = %self.name(), shape = shape.label(), "executing query");

        let result = match shape {
            QueryShape::Find => self.find(query),
            QueryShape::Group { group_by } => self.group(query, group_by),
            QueryShape::PeriodGroup { period } => self.period_group(query, period),
            QueryShape::MultiPeriodGroup { group_by, period } => {
                self.multi_period_group(query, group_by, period)
            }
        };

        timer.observe_duration();
        if let Err(e) = &result {
            metrics::QUERY_ERRORS.with_label_values(&[e.kind()]).inc();
        }
        result
    }

    fn find(&self, query: &Query) -> Result<Data> {
        let rows = self
            .repository
            .find(query, query.sort_by(), query.limit())
            .map_err(|e| self.storage_error(e))?;
        Ok(SimpleData::new(rows).into())
    }

    fn group(&self, query: &Query, group_by: &str) -> Result<Data> {
        let rows = self
            .repository
            .group(group_by, query, query.sort_by(), query.limit(), query.collect())
            .map_err(|e| self.storage_error(e))?;
        Ok(SimpleData::new(rows).into())
    }

    fn period_group(&self, query: &Query, period: Period) -> Result<Data> {
        let field = period.field_name();
        let rows = self
            .repository
            .group(
                field,
                query,
                Some(&SortBy::ascending(field)),
                query.limit(),
                query.collect(),
            )
            .map_err(|e| self.storage_error(e))?;

        let counts = self.period_counts(period, rows)?;
        let entries = self.fill_periods(period, query, counts)?;
        Ok(PeriodData::new(entries).into())
    }

    fn multi_period_group(&self, query: &Query, group_by: &str, period: Period) -> Result<Data> {
        let rows = self
            .repository
            .multi_group(
                group_by,
                period.field_name(),
                query,
                query.sort_by(),
                query.limit(),
                query.collect(),
            )
            .map_err(|e| self.storage_error(e))?;

        // Validate every group before shaping any of them.
        let groups = rows
            .into_iter()
            .map(|mut row| -> Result<(Document, Vec<PeriodCount>)> {
                let subgroup = self.subgroup_documents(row.remove(SUBGROUP_FIELD))?;
                Ok((row, self.period_counts(period, subgroup)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut shaped = Vec::with_capacity(groups.len());
        for (mut row, counts) in groups {
            let values = self.fill_periods(period, query, counts)?;
            row.insert(
                VALUES_FIELD.to_string(),
                Value::List(values.into_iter().map(Value::Document).collect()),
            );
            shaped.push(row);
        }
        Ok(PeriodData::new(shaped).into())
    }

    fn subgroup_documents(&self, subgroup: Option<Value>) -> Result<Vec<Document>> {
        let items = match subgroup {
            None => return Ok(Vec::new()),
            Some(Value::List(items)) => items,
            Some(_) => return Err(self.inconsistent(SUBGROUP_FIELD, "expected a list of rows")),
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::Document(doc) => Ok(doc),
                _ => Err(self.inconsistent(SUBGROUP_FIELD, "expected a list of rows")),
            })
            .collect()
    }

    /// Check each raw row's period marker and count.
    fn period_counts(&self, period: Period, rows: Vec<Document>) -> Result<Vec<PeriodCount>> {
        let field = period.field_name();
        rows.into_iter()
            .map(|mut row| -> Result<PeriodCount> {
                let start = row
                    .remove(field)
                    .ok_or_else(|| self.inconsistent(field, "period field missing from grouped row"))?
                    .as_timestamp()
                    .ok_or_else(|| self.inconsistent(field, "period field is not a timestamp"))?;
                if let Err(misaligned) = period.validate_alignment(start) {
                    error!(bucket = %self.name(), field, value = %start, "misaligned period marker");
                    return Err(self.inconsistent(field, misaligned.to_string()));
                }
                let count = row
                    .remove(COUNT_FIELD)
                    .and_then(|count| count.as_i64())
                    .ok_or_else(|| self.inconsistent(COUNT_FIELD, "count missing or not an integer"))?;
                Ok(PeriodCount {
                    start,
                    count,
                    extra: row,
                })
            })
            .collect()
    }

    /// Shape validated period rows into ascending `_start_at`/`_end_at`/`_count`
    /// entries.
    ///
    /// With both `start_at` and `end_at` every period of the range is present,
    /// zero where nothing was counted. Otherwise only the observed periods are
    /// returned.
    fn fill_periods(
        &self,
        period: Period,
        query: &Query,
        counts: Vec<PeriodCount>,
    ) -> Result<Vec<Document>> {
        let mut by_start: BTreeMap<DateTime<Utc>, PeriodCount> = BTreeMap::new();
        for count in counts {
            match by_start.get_mut(&count.start) {
                Some(existing) => {
                    existing.count = existing
                        .count
                        .checked_add(count.count)
                        .ok_or_else(|| self.inconsistent(COUNT_FIELD, "count overflow"))?;
                }
                None => {
                    by_start.insert(count.start, count);
                }
            }
        }

        let (Some(start_at), Some(end_at)) = (query.start_at(), query.end_at()) else {
            return Ok(by_start
                .into_values()
                .map(|found| {
                    let end = period.next_start(found.start);
                    period_entry(found.extra, found.start, end, found.count)
                })
                .collect());
        };

        let mut entries = Vec::new();
        let mut synthesized = 0u64;
        for span in period.enumerate(start_at, end_at) {
            let entry = match by_start.remove(&span.start) {
                Some(found) => period_entry(found.extra, span.start, span.end, found.count),
                None => {
                    synthesized += 1;
                    period_entry(Document::new(), span.start, span.end, 0)
                }
            };
            entries.push(entry);
        }

        if !by_start.is_empty() {
            warn!(
                bucket = %self.name(),
                dropped = by_start.len(),
                "grouped rows outside the query range were dropped"
            );
        }
        debug!(bucket = %self.name(), periods = entries.len(), synthesized, "filled periods");
        metrics::PERIODS_SYNTHESIZED.inc_by(synthesized as f64);
        Ok(entries)
    }

    fn inconsistent(&self, field: &str, details: impl Into<String>) -> BucketError {
        BucketError::Consistency {
            bucket: self.name().to_string(),
            field: field.to_string(),
            details: details.into(),
        }
    }

    fn storage_error(&self, source: StorageError) -> BucketError {
        warn!(bucket = %self.name(), "repository call failed: {}", source);
        BucketError::Storage {
            bucket: self.name().to_string(),
            source,
        }
    }
}

fn period_entry(
    mut entry: Document,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    count: i64,
) -> Document {
    entry.insert(START_AT_FIELD.to_string(), Value::Timestamp(start));
    entry.insert(END_AT_FIELD.to_string(), Value::Timestamp(end));
    entry.insert(COUNT_FIELD.to_string(), Value::Int(count));
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Save(Document),
        Find {
            query: Query,
            sort: Option<SortBy>,
            limit: Option<u32>,
        },
        Group {
            key: String,
            query: Query,
            sort: Option<SortBy>,
            limit: Option<u32>,
            collect: Vec<String>,
        },
        MultiGroup {
            group_key: String,
            period_key: String,
            query: Query,
            sort: Option<SortBy>,
            limit: Option<u32>,
            collect: Vec<String>,
        },
    }

    /// Records every call and answers with canned rows.
    #[derive(Default)]
    struct FakeRepository {
        calls: Mutex<Vec<Call>>,
        find_rows: Vec<Document>,
        group_rows: Vec<Document>,
        multi_group_rows: Vec<Document>,
        reject_saves: bool,
    }

    impl FakeRepository {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Repository for FakeRepository {
        fn save(&self, document: &Document) -> Result<(), StorageError> {
            if self.reject_saves {
                return Err(StorageError::Rejected("read-only".into()));
            }
            self.record(Call::Save(document.clone()));
            Ok(())
        }

        fn find(
            &self,
            query: &Query,
            sort: Option<&SortBy>,
            limit: Option<u32>,
        ) -> Result<Vec<Document>, StorageError> {
            self.record(Call::Find {
                query: query.clone(),
                sort: sort.cloned(),
                limit,
            });
            Ok(self.find_rows.clone())
        }

        fn group(
            &self,
            key: &str,
            query: &Query,
            sort: Option<&SortBy>,
            limit: Option<u32>,
            collect: &[String],
        ) -> Result<Vec<Document>, StorageError> {
            self.record(Call::Group {
                key: key.to_string(),
                query: query.clone(),
                sort: sort.cloned(),
                limit,
                collect: collect.to_vec(),
            });
            Ok(self.group_rows.clone())
        }

        fn multi_group(
            &self,
            group_key: &str,
            period_key: &str,
            query: &Query,
            sort: Option<&SortBy>,
            limit: Option<u32>,
            collect: &[String],
        ) -> Result<Vec<Document>, StorageError> {
            self.record(Call::MultiGroup {
                group_key: group_key.to_string(),
                period_key: period_key.to_string(),
                query: query.clone(),
                sort: sort.cloned(),
                limit,
                collect: collect.to_vec(),
            });
            Ok(self.multi_group_rows.clone())
        }
    }

    /// Zone-less timestamp, as a repository may hand it back.
    fn d(y: i32, m: u32, day: u32) -> Value {
        let naive = NaiveDate::from_ymd_opt(y, m, day).unwrap().and_hms_opt(0, 0, 0).unwrap();
        Value::NaiveTimestamp(naive)
    }

    fn d_tz(y: i32, m: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, day, 0, 0, 0).unwrap()
    }

    fn doc(pairs: Vec<(&str, Value)>) -> Document {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn week(start: Value, count: i64) -> Document {
        doc(vec![("_week_start_at", start), ("_count", Value::Int(count))])
    }

    fn month(start: Value, count: i64) -> Document {
        doc(vec![("_month_start_at", start), ("_count", Value::Int(count))])
    }

    fn multi(group: &str, subgroup: Vec<Document>) -> Document {
        let total = subgroup.iter().filter_map(|s| s["_count"].as_i64()).sum::<i64>();
        doc(vec![
            ("some_group", Value::from(group)),
            ("_count", Value::Int(total)),
            ("_group_count", Value::Int(subgroup.len() as i64)),
            ("_subgroup", Value::List(subgroup.into_iter().map(Value::Document).collect())),
        ])
    }

    fn bucket_with(repository: FakeRepository) -> (Bucket, Arc<FakeRepository>) {
        let repository = Arc::new(repository);
        let config = BucketConfig::builder("test_bucket", "group", "type").build().unwrap();
        (Bucket::new(config, repository.clone()), repository)
    }

    fn entry_at(values: &Value, index: usize) -> (DateTime<Utc>, DateTime<Utc>, i64) {
        let entry = values.as_list().unwrap()[index].as_document().unwrap();
        entry_tuple(entry)
    }

    fn entry_tuple(entry: &Document) -> (DateTime<Utc>, DateTime<Utc>, i64) {
        (
            entry["_start_at"].as_timestamp().unwrap(),
            entry["_end_at"].as_timestamp().unwrap(),
            entry["_count"].as_i64().unwrap(),
        )
    }

    fn starts_and_counts(rows: &[Document]) -> Vec<(DateTime<Utc>, i64)> {
        rows.iter()
            .map(|r| (r["_start_at"].as_timestamp().unwrap(), r["_count"].as_i64().unwrap()))
            .collect()
    }

    fn group_values<'a>(data: &'a Data, group: &str) -> &'a [Value] {
        data.data()
            .iter()
            .find(|row| row["some_group"] == Value::from(group))
            .and_then(|row| row["values"].as_list())
            .unwrap()
    }

    // ── store ────────────────────────────────────────────────────────────────

    #[test]
    fn test_that_a_single_object_gets_stored() {
        let (bucket, repo) = bucket_with(FakeRepository::default());
        let record = Record::new(doc(vec![("name", Value::from("Gummo"))]));

        bucket.store(&record).unwrap();

        assert_eq!(repo.calls(), vec![Call::Save(doc(vec![("name", Value::from("Gummo"))]))]);
    }

    #[test]
    fn test_that_a_list_of_objects_get_stored_in_order() {
        let (bucket, repo) = bucket_with(FakeRepository::default());
        let records: Vec<Record> = ["Groucho", "Harpo", "Chico"]
            .iter()
            .map(|name| Record::new(doc(vec![("name", Value::from(*name))])))
            .collect();

        bucket.store_all(&records).unwrap();

        let saved: Vec<Call> = records.iter().map(|r| Call::Save(r.data().clone())).collect();
        assert_eq!(repo.calls(), saved);
    }

    #[test]
    fn test_rejected_write_is_a_storage_error() {
        let (bucket, _) = bucket_with(FakeRepository {
            reject_saves: true,
            ..Default::default()
        });
        let err = bucket.store(&Record::default()).unwrap_err();
        assert_eq!(err.kind(), "storage");
        assert!(err.to_string().contains("test_bucket"));
    }

    // ── find / group ─────────────────────────────────────────────────────────

    #[test]
    fn test_filter_by_query() {
        let (bucket, repo) = bucket_with(FakeRepository::default());
        let query = Query::builder().filter_by("name", "Chico").build().unwrap();

        let data = bucket.query(&query).unwrap();

        assert_eq!(
            repo.calls(),
            vec![Call::Find {
                query,
                sort: None,
                limit: None
            }]
        );
        assert!(data.is_empty());
        assert!(!data.is_period());
    }

    #[test]
    fn test_query_with_range_sort_and_limit_goes_to_find() {
        let (bucket, repo) = bucket_with(FakeRepository::default());
        let query = Query::builder()
            .start_at(Utc.with_ymd_and_hms(2013, 2, 1, 12, 0, 0).unwrap())
            .end_at(Utc.with_ymd_and_hms(2013, 3, 1, 12, 0, 0).unwrap())
            .sort_by(SortBy::descending("keyname"))
            .limit(5)
            .build()
            .unwrap();

        bucket.query(&query).unwrap();

        assert_eq!(
            repo.calls(),
            vec![Call::Find {
                query,
                sort: Some(SortBy::descending("keyname")),
                limit: Some(5)
            }]
        );
    }

    #[test]
    fn test_group_by_query() {
        let (bucket, repo) = bucket_with(FakeRepository {
            group_rows: vec![
                doc(vec![("name", Value::from("Max")), ("_count", Value::Int(3))]),
                doc(vec![("name", Value::from("Gareth")), ("_count", Value::Int(2))]),
            ],
            ..Default::default()
        });
        let query = Query::builder().group_by("name").build().unwrap();

        let data = bucket.query(&query).unwrap();

        assert_eq!(
            repo.calls(),
            vec![Call::Group {
                key: "name".into(),
                query,
                sort: None,
                limit: None,
                collect: vec![]
            }]
        );
        assert_eq!(
            data.data(),
            &[
                doc(vec![("name", Value::from("Max")), ("_count", Value::Int(3))]),
                doc(vec![("name", Value::from("Gareth")), ("_count", Value::Int(2))]),
            ]
        );
    }

    #[test]
    fn test_sorted_group_by_query_with_limit_and_collect() {
        let (bucket, repo) = bucket_with(FakeRepository::default());
        let query = Query::builder()
            .group_by("name")
            .sort_by(SortBy::ascending("name"))
            .limit(100)
            .collect("key")
            .build()
            .unwrap();

        bucket.query(&query).unwrap();

        assert_eq!(
            repo.calls(),
            vec![Call::Group {
                key: "name".into(),
                query,
                sort: Some(SortBy::ascending("name")),
                limit: Some(100),
                collect: vec!["key".into()]
            }]
        );
    }

    // ── period ───────────────────────────────────────────────────────────────

    #[test]
    fn test_week_query() {
        let (bucket, repo) = bucket_with(FakeRepository {
            group_rows: vec![week(d(2013, 1, 7), 3), week(d(2013, 1, 14), 1)],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Week).build().unwrap();

        let data = bucket.query(&query).unwrap();

        assert_eq!(
            repo.calls(),
            vec![Call::Group {
                key: "_week_start_at".into(),
                query,
                sort: Some(SortBy::ascending("_week_start_at")),
                limit: None,
                collect: vec![]
            }]
        );
        assert!(data.is_period());
        let entries: Vec<_> = data.data().iter().map(entry_tuple).collect();
        assert_eq!(
            entries,
            vec![
                (d_tz(2013, 1, 7), d_tz(2013, 1, 14), 3),
                (d_tz(2013, 1, 14), d_tz(2013, 1, 21), 1),
            ]
        );
    }

    #[test]
    fn test_month_query() {
        let (bucket, repo) = bucket_with(FakeRepository {
            group_rows: vec![month(d(2013, 4, 1), 1), month(d(2013, 5, 1), 3)],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Month).limit(1).build().unwrap();

        let data = bucket.query(&query).unwrap();

        assert_eq!(
            repo.calls(),
            vec![Call::Group {
                key: "_month_start_at".into(),
                query,
                sort: Some(SortBy::ascending("_month_start_at")),
                limit: Some(1),
                collect: vec![]
            }]
        );
        let entries: Vec<_> = data.data().iter().map(entry_tuple).collect();
        assert_eq!(
            entries,
            vec![
                (d_tz(2013, 4, 1), d_tz(2013, 5, 1), 1),
                (d_tz(2013, 5, 1), d_tz(2013, 6, 1), 3),
            ]
        );
    }

    #[test]
    fn test_period_query_fails_when_weeks_do_not_start_on_monday() {
        let (bucket, _) = bucket_with(FakeRepository {
            group_rows: vec![week(d(2013, 1, 7), 3), week(d(2013, 1, 8), 1)],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Week).build().unwrap();

        let err = bucket.query(&query).unwrap_err();

        assert!(matches!(
            err,
            BucketError::Consistency { ref field, .. } if field == "_week_start_at"
        ));
    }

    #[test]
    fn test_period_query_fails_when_months_do_not_start_on_the_1st() {
        let (bucket, _) = bucket_with(FakeRepository {
            group_rows: vec![month(d(2013, 1, 7), 3), month(d(2013, 2, 8), 1)],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Month).build().unwrap();

        assert_eq!(bucket.query(&query).unwrap_err().kind(), "consistency");
    }

    #[test]
    fn test_period_query_rejects_rows_without_a_timestamp_marker() {
        let (bucket, _) = bucket_with(FakeRepository {
            group_rows: vec![week(Value::from("2013-01-07"), 3)],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Week).build().unwrap();

        assert_eq!(bucket.query(&query).unwrap_err().kind(), "consistency");
    }

    #[test]
    fn test_period_query_adds_missing_periods_in_correct_order() {
        let (bucket, _) = bucket_with(FakeRepository {
            group_rows: vec![
                week(d(2013, 1, 7), 32),
                week(d(2013, 1, 21), 45),
                week(d(2013, 2, 4), 17),
            ],
            ..Default::default()
        });
        let query = Query::builder()
            .period(Period::Week)
            .start_at(d_tz(2013, 1, 7))
            .end_at(d_tz(2013, 2, 18))
            .build()
            .unwrap();

        let data = bucket.query(&query).unwrap();

        assert_eq!(
            starts_and_counts(data.data()),
            vec![
                (d_tz(2013, 1, 7), 32),
                (d_tz(2013, 1, 14), 0),
                (d_tz(2013, 1, 21), 45),
                (d_tz(2013, 1, 28), 0),
                (d_tz(2013, 2, 4), 17),
                (d_tz(2013, 2, 11), 0),
            ]
        );
    }

    #[test]
    fn test_period_query_with_one_bound_returns_observed_periods() {
        let (bucket, _) = bucket_with(FakeRepository {
            group_rows: vec![week(d(2013, 1, 14), 2), week(d(2013, 1, 28), 1)],
            ..Default::default()
        });
        let query = Query::builder()
            .period(Period::Week)
            .start_at(d_tz(2013, 1, 2))
            .build()
            .unwrap();

        let data = bucket.query(&query).unwrap();

        assert_eq!(
            starts_and_counts(data.data()),
            vec![(d_tz(2013, 1, 14), 2), (d_tz(2013, 1, 28), 1)]
        );
    }

    #[test]
    fn test_period_query_without_range_does_not_fill_gaps() {
        let (bucket, _) = bucket_with(FakeRepository {
            group_rows: vec![month(d(2013, 7, 1), 6), month(d(2013, 3, 1), 2)],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Month).build().unwrap();

        let data = bucket.query(&query).unwrap();

        let entries: Vec<_> = data.data().iter().map(entry_tuple).collect();
        assert_eq!(
            entries,
            vec![
                (d_tz(2013, 3, 1), d_tz(2013, 4, 1), 2),
                (d_tz(2013, 7, 1), d_tz(2013, 8, 1), 6),
            ]
        );
    }

    #[test]
    fn test_period_query_without_rows_or_range_is_empty() {
        let (bucket, _) = bucket_with(FakeRepository::default());
        let query = Query::builder().period(Period::Week).build().unwrap();

        assert!(bucket.query(&query).unwrap().is_empty());
    }

    #[test]
    fn test_period_query_with_half_open_range_and_no_rows_is_empty() {
        let (bucket, _) = bucket_with(FakeRepository::default());
        let query = Query::builder()
            .period(Period::Month)
            .end_at(d_tz(2013, 4, 1))
            .build()
            .unwrap();

        assert!(bucket.query(&query).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_period_rows_are_summed() {
        let (bucket, _) = bucket_with(FakeRepository {
            group_rows: vec![week(d(2013, 1, 7), 3), week(d(2013, 1, 7), 4)],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Week).build().unwrap();

        let data = bucket.query(&query).unwrap();

        assert_eq!(starts_and_counts(data.data()), vec![(d_tz(2013, 1, 7), 7)]);
    }

    #[test]
    fn test_duplicate_period_rows_overflowing_the_count_fail() {
        let (bucket, _) = bucket_with(FakeRepository {
            group_rows: vec![week(d(2013, 1, 7), i64::MAX), week(d(2013, 1, 7), 1)],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Week).build().unwrap();

        let err = bucket.query(&query).unwrap_err();

        assert!(matches!(
            err,
            BucketError::Consistency { ref field, .. } if field == "_count"
        ));
    }

    #[test]
    fn test_period_marker_at_earliest_instant_is_misaligned() {
        let (bucket, _) = bucket_with(FakeRepository {
            group_rows: vec![week(Value::Timestamp(DateTime::<Utc>::MIN_UTC), 1)],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Week).build().unwrap();

        let err = bucket.query(&query).unwrap_err();

        assert!(matches!(
            err,
            BucketError::Consistency { ref field, .. } if field == "_week_start_at"
        ));
    }

    #[test]
    fn test_period_query_keeps_collected_fields() {
        let mut row = week(d(2013, 1, 7), 2);
        row.insert("name".into(), Value::List(vec![Value::from("a"), Value::from("b")]));
        let (bucket, _) = bucket_with(FakeRepository {
            group_rows: vec![row],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Week).collect("name").build().unwrap();

        let data = bucket.query(&query).unwrap();

        assert_eq!(data.data()[0]["name"].as_list().unwrap().len(), 2);
        assert!(!data.data()[0].contains_key("_week_start_at"));
    }

    // ── period × group ───────────────────────────────────────────────────────

    #[test]
    fn test_week_and_group_query() {
        let (bucket, _) = bucket_with(FakeRepository {
            multi_group_rows: vec![
                multi("val1", vec![week(d(2013, 1, 7), 1), week(d(2013, 1, 14), 5)]),
                multi("val2", vec![week(d(2013, 1, 7), 2), week(d(2013, 1, 14), 6)]),
            ],
            ..Default::default()
        });
        let query = Query::builder()
            .period(Period::Week)
            .group_by("some_group")
            .build()
            .unwrap();

        let data = bucket.query(&query).unwrap();

        assert_eq!(data.len(), 2);
        let val1 = &data.data()[0];
        assert_eq!(val1["some_group"], Value::from("val1"));
        assert!(!val1.contains_key("_subgroup"));
        assert_eq!(entry_at(&val1["values"], 0), (d_tz(2013, 1, 7), d_tz(2013, 1, 14), 1));
        assert_eq!(entry_at(&val1["values"], 1), (d_tz(2013, 1, 14), d_tz(2013, 1, 21), 5));
        assert_eq!(val1["values"].as_list().unwrap().len(), 2);

        let val2 = &data.data()[1];
        assert_eq!(val2["some_group"], Value::from("val2"));
        assert_eq!(entry_at(&val2["values"], 0), (d_tz(2013, 1, 7), d_tz(2013, 1, 14), 2));
        assert_eq!(entry_at(&val2["values"], 1), (d_tz(2013, 1, 14), d_tz(2013, 1, 21), 6));
    }

    #[test]
    fn test_month_and_group_query_without_range_keeps_observed_months() {
        let (bucket, _) = bucket_with(FakeRepository {
            multi_group_rows: vec![
                multi("val1", vec![month(d(2013, 1, 1), 1), month(d(2013, 2, 1), 5)]),
                multi(
                    "val2",
                    vec![month(d(2013, 3, 1), 2), month(d(2013, 4, 1), 6), month(d(2013, 7, 1), 6)],
                ),
            ],
            ..Default::default()
        });
        let query = Query::builder()
            .period(Period::Month)
            .group_by("some_group")
            .build()
            .unwrap();

        let data = bucket.query(&query).unwrap();

        assert_eq!(group_values(&data, "val1").len(), 2);
        // no range given: observed months only, May and June are not filled
        assert_eq!(group_values(&data, "val2").len(), 3);
    }

    #[test]
    fn test_month_and_group_query_with_start_and_end_at() {
        let (bucket, _) = bucket_with(FakeRepository {
            multi_group_rows: vec![
                multi("val1", vec![month(d(2013, 1, 1), 1), month(d(2013, 2, 1), 5)]),
                multi(
                    "val2",
                    vec![month(d(2013, 3, 1), 2), month(d(2013, 4, 1), 6), month(d(2013, 7, 1), 6)],
                ),
            ],
            ..Default::default()
        });
        let query = Query::builder()
            .period(Period::Month)
            .group_by("some_group")
            .start_at(d_tz(2013, 1, 1))
            .end_at(d_tz(2013, 4, 2))
            .build()
            .unwrap();

        let data = bucket.query(&query).unwrap();

        let months = vec![d_tz(2013, 1, 1), d_tz(2013, 2, 1), d_tz(2013, 3, 1), d_tz(2013, 4, 1)];
        for group in ["val1", "val2"] {
            let starts: Vec<_> = group_values(&data, group)
                .iter()
                .map(|v| v.as_document().unwrap()["_start_at"].as_timestamp().unwrap())
                .collect();
            assert_eq!(starts, months);
        }
    }

    #[test]
    fn test_period_group_query_adds_missing_periods_in_correct_order() {
        let (bucket, _) = bucket_with(FakeRepository {
            multi_group_rows: vec![
                multi("val1", vec![week(d(2013, 1, 14), 23), week(d(2013, 1, 21), 41)]),
                multi("val2", vec![week(d(2013, 1, 14), 31), week(d(2013, 1, 28), 12)]),
            ],
            ..Default::default()
        });
        let query = Query::builder()
            .period(Period::Week)
            .group_by("some_group")
            .start_at(d_tz(2013, 1, 7))
            .end_at(d_tz(2013, 2, 4))
            .build()
            .unwrap();

        let data = bucket.query(&query).unwrap();

        let counts = |group: &str| -> Vec<i64> {
            group_values(&data, group)
                .iter()
                .map(|v| v.as_document().unwrap()["_count"].as_i64().unwrap())
                .collect()
        };
        assert_eq!(counts("val1"), vec![0, 23, 41, 0]);
        assert_eq!(counts("val2"), vec![0, 31, 0, 12]);
        // top-level order comes from the repository
        assert_eq!(data.data()[0]["some_group"], Value::from("val1"));
        assert_eq!(data.data()[1]["some_group"], Value::from("val2"));
    }

    #[test]
    fn test_sorted_week_and_group_query_with_limit() {
        let (bucket, repo) = bucket_with(FakeRepository {
            multi_group_rows: vec![multi("val1", vec![week(d(2013, 1, 7), 1)])],
            ..Default::default()
        });
        let query = Query::builder()
            .period(Period::Week)
            .group_by("some_group")
            .sort_by(SortBy::descending("_count"))
            .limit(1)
            .build()
            .unwrap();

        bucket.query(&query).unwrap();

        assert_eq!(
            repo.calls(),
            vec![Call::MultiGroup {
                group_key: "some_group".into(),
                period_key: "_week_start_at".into(),
                query,
                sort: Some(SortBy::descending("_count")),
                limit: Some(1),
                collect: vec![]
            }]
        );
    }

    #[test]
    fn test_period_group_query_fails_when_weeks_do_not_start_on_monday() {
        let row = |label: &str, start: Value| {
            doc(vec![
                ("is", Value::from(label)),
                ("_subgroup", Value::List(vec![Value::Document(week(start, 1))])),
            ])
        };
        let (bucket, _) = bucket_with(FakeRepository {
            multi_group_rows: vec![
                row("Monday", d(2013, 4, 1)),
                row("also Monday", d(2013, 4, 8)),
                row("Tuesday", d(2013, 4, 9)),
            ],
            ..Default::default()
        });
        let query = Query::builder().period(Period::Week).group_by("d").build().unwrap();

        assert_eq!(bucket.query(&query).unwrap_err().kind(), "consistency");
    }
}
