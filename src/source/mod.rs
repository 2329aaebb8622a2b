//! Record source adapters.
//!
//! A source executes one query and hands back a bounded, ordered result set
//! plus the column ordering used for delimited output. The concrete wire
//! drivers live behind `sqlx` (relational kinds) and the `mongodb` client
//! (document kinds); everything above them talks to [`RecordSource`] only.

pub mod document;
pub mod relational;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::errors::Result;

/// One normalized record: field name to JSON-compatible value.
pub type Record = Map<String, Value>;

/// A bounded query result, in source order.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// Column ordering for delimited output. Present even when `records` is
    /// empty, so a zero-row extraction can still write its header.
    pub columns: Vec<String>,
    pub records: Vec<Record>,
}

impl ResultSet {
    /// Dense partitions of at most `batch_size` records, preserving order.
    pub fn partitions(&self, batch_size: usize) -> impl Iterator<Item = &[Record]> {
        self.records.chunks(batch_size.max(1))
    }

    /// Render one record as cells in column order; missing fields become
    /// empty strings.
    pub fn cells(&self, record: &Record) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| {
                record
                    .get(column)
                    .map(crate::writer::cell_to_string)
                    .unwrap_or_default()
            })
            .collect()
    }
}

/// Common capability set of every record source.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Execute `query` and return the full bounded result.
    async fn execute(&self, query: &str) -> Result<ResultSet>;

    /// Release pooled resources. Called on every exit path of a task.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_partitions_are_dense_and_ordered() {
        let set = ResultSet {
            columns: vec!["id".into()],
            records: (0..5).map(|i| record(&[("id", json!(i))])).collect(),
        };
        let sizes: Vec<usize> = set.partitions(2).map(|p| p.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let first = set.partitions(2).next().unwrap();
        assert_eq!(first[0]["id"], json!(0));
    }

    #[test]
    fn test_cells_default_missing_fields_to_empty() {
        let set = ResultSet {
            columns: vec!["a".into(), "b".into()],
            records: vec![record(&[("a", json!("x"))])],
        };
        assert_eq!(set.cells(&set.records[0]), vec!["x".to_string(), String::new()]);
    }

    #[test]
    fn test_zero_batch_size_still_makes_progress() {
        let set = ResultSet {
            columns: vec![],
            records: vec![record(&[])],
        };
        assert_eq!(set.partitions(0).count(), 1);
    }
}
