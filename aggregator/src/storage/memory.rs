//! In-memory repository
//!
//! Reference [`Repository`] used by tests and the CLI. Documents live in a
//! `RwLock`ed ring; a capped repository drops its oldest document when full.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::RwLock;

use tally_shared::{Document, Value, COUNT_FIELD, TIMESTAMP_FIELD};

use super::{Repository, StorageError, GROUP_COUNT_FIELD, SUBGROUP_FIELD};
use crate::query::{Query, SortBy, SortDirection};

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    max_documents: Option<usize>,
    documents: RwLock<VecDeque<Document>>,
}

/// Documents sharing one value of the grouping key, in insertion order.
struct Group {
    value: Value,
    documents: Vec<Document>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// A repository that keeps at most `max_documents` documents.
    pub fn capped(max_documents: usize) -> Self {
        Self {
            max_documents: Some(max_documents),
            documents: RwLock::new(VecDeque::with_capacity(max_documents.min(4096))),
        }
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        let documents = self.documents.read().map_err(poisoned)?;
        Ok(documents.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Documents satisfying the query's filters and time range.
    fn matching(&self, query: &Query) -> Result<Vec<Document>, StorageError> {
        let documents = self.documents.read().map_err(poisoned)?;
        Ok(documents
            .iter()
            .filter(|doc| matches_query(doc, query))
            .cloned()
            .collect())
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Unavailable(format!("lock poisoned: {}", e))
}

fn matches_query(doc: &Document, query: &Query) -> bool {
    let filters_match = query
        .filter_by()
        .iter()
        .all(|(key, expected)| doc.get(key).is_some_and(|value| value.matches(expected)));
    if !filters_match {
        return false;
    }
    if query.start_at().is_none() && query.end_at().is_none() {
        return true;
    }
    let Some(ts) = doc.get(TIMESTAMP_FIELD).and_then(Value::as_timestamp) else {
        return false;
    };
    query.start_at().map_or(true, |start| ts >= start) && query.end_at().map_or(true, |end| ts < end)
}

fn field_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.sort_cmp(b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable sort, then truncate.
fn sort_and_limit(rows: &mut Vec<Document>, sort: Option<&SortBy>, limit: Option<u32>) {
    if let Some(sort) = sort {
        rows.sort_by(|a, b| {
            let ordering = field_cmp(a.get(&sort.field), b.get(&sort.field));
            match sort.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        });
    }
    if let Some(limit) = limit {
        rows.truncate(limit as usize);
    }
}

/// Partition documents by the value of `key`, skipping documents without it.
fn partition(documents: Vec<Document>, key: &str) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for doc in documents {
        let Some(value) = doc.get(key).cloned() else {
            continue;
        };
        match groups.iter_mut().find(|g| g.value.matches(&value)) {
            Some(group) => group.documents.push(doc),
            None => groups.push(Group {
                value,
                documents: vec![doc],
            }),
        }
    }
    groups
}

/// `{key: value, _count, ...collect}` for one group.
fn group_row(key: &str, group: &Group, collect: &[String]) -> Document {
    let mut row = Document::new();
    row.insert(key.to_string(), group.value.clone());
    row.insert(COUNT_FIELD.to_string(), Value::Int(group.documents.len() as i64));
    for field in collect {
        let values = group
            .documents
            .iter()
            .filter_map(|doc| doc.get(field).cloned())
            .collect();
        row.insert(field.clone(), Value::List(values));
    }
    row
}

impl Repository for InMemoryRepository {
    fn save(&self, document: &Document) -> Result<(), StorageError> {
        let mut documents = self.documents.write().map_err(poisoned)?;
        documents.push_back(document.clone());
        if let Some(max) = self.max_documents {
            while documents.len() > max {
                documents.pop_front();
            }
        }
        Ok(())
    }

    fn find(
        &self,
        query: &Query,
        sort: Option<&SortBy>,
        limit: Option<u32>,
    ) -> Result<Vec<Document>, StorageError> {
        let mut rows = self.matching(query)?;
        sort_and_limit(&mut rows, sort, limit);
        tracing::debug!(rows = rows.len(), "in-memory find");
        Ok(rows)
    }

    fn group(
        &self,
        key: &str,
        query: &Query,
        sort: Option<&SortBy>,
        limit: Option<u32>,
        collect: &[String],
    ) -> Result<Vec<Document>, StorageError> {
        let groups = partition(self.matching(query)?, key);
        let mut rows: Vec<Document> = groups.iter().map(|g| group_row(key, g, collect)).collect();
        sort_and_limit(&mut rows, sort, limit);
        tracing::debug!(key, rows = rows.len(), "in-memory group");
        Ok(rows)
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
        let documents: Vec<Document> = self
            .matching(query)?
            .into_iter()
            .filter(|doc| doc.contains_key(period_key))
            .collect();

        let mut rows: Vec<Document> = partition(documents, group_key)
            .into_iter()
            .map(|group| {
                let mut row = group_row(group_key, &group, collect);
                let mut subgroups: Vec<Document> = partition(group.documents, period_key)
                    .iter()
                    .map(|sub| group_row(period_key, sub, &[]))
                    .collect();
                sort_and_limit(&mut subgroups, Some(&SortBy::ascending(period_key)), None);

                row.insert(GROUP_COUNT_FIELD.to_string(), Value::Int(subgroups.len() as i64));
                row.insert(
                    SUBGROUP_FIELD.to_string(),
                    Value::List(subgroups.into_iter().map(Value::Document).collect()),
                );
                row
            })
            .collect();
        sort_and_limit(&mut rows, sort, limit);
        tracing::debug!(group_key, period_key, rows = rows.len(), "in-memory multi_group");
        Ok(rows)
    }
}
