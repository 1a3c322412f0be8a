//! Batch splitting, column projection and the per-batch transaction driver
//! shared by all importers.

use std::ops::Range;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::dialect::coerce::{coerce_row, CoercionRules};
use crate::error::{MigrateError, Result};

use super::value::Row;

/// Split `total` rows into contiguous ranges of at most `batch_size` rows.
///
/// A `batch_size` of zero is treated as one.
pub fn batch_ranges(total: usize, batch_size: usize) -> impl Iterator<Item = Range<usize>> {
    let size = batch_size.max(1);
    (0..total)
        .step_by(size)
        .map(move |start| start..(start + size).min(total))
}

/// Mapping from source row slots to the columns the target actually has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnProjection {
    /// Target column names, target spelling, source order.
    pub columns: Vec<String>,
    /// Source slot index for each entry of `columns`.
    pub indices: Vec<usize>,
    /// Source columns with no counterpart in the target.
    pub skipped: Vec<String>,
}

impl ColumnProjection {
    /// Intersect `source` with `target`, matching names case-insensitively.
    pub fn resolve(source: &[String], target: &[String]) -> Self {
        let mut projection = ColumnProjection {
            columns: Vec::with_capacity(source.len()),
            indices: Vec::with_capacity(source.len()),
            skipped: Vec::new(),
        };

        for (idx, name) in source.iter().enumerate() {
            match target.iter().find(|t| t.eq_ignore_ascii_case(name)) {
                Some(actual) => {
                    projection.columns.push(actual.clone());
                    projection.indices.push(idx);
                }
                None => projection.skipped.push(name.clone()),
            }
        }
        projection
    }

    /// Log the skipped columns, if any.
    pub fn warn_skipped(&self, table: &str) {
        if !self.skipped.is_empty() {
            warn!(
                "{}: skipping source columns not present in target: {}",
                table,
                self.skipped.join(", ")
            );
        }
    }

    /// True when no source column matched.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Narrow a row to the projected columns.
    ///
    /// Missing trailing slots are filled with the value `Null`.
    pub fn project(&self, row: &Row) -> Row {
        self.indices
            .iter()
            .map(|&i| {
                row.get(i)
                    .cloned()
                    .unwrap_or(crate::core::SqlValue::Null(crate::core::SqlNullType::String))
            })
            .collect()
    }

    /// Project every row and coerce each value against the target column
    /// type at the same position of `target_types`.
    pub fn prepare(&self, rows: &[Row], target_types: &[String], rules: &CoercionRules) -> Vec<Row> {
        rows.iter()
            .map(|row| coerce_row(self.project(row), target_types, rules))
            .collect()
    }
}

/// One transactional unit of work.
///
/// `write_batch` must either commit all of `rows` or none of them.
#[async_trait]
pub trait BatchSink: Send {
    /// Write one batch starting at row `offset` of the table.
    async fn write_batch(&mut self, offset: usize, rows: &[Row]) -> Result<u64>;
}

/// Drive `rows` through `sink` in order, one batch at a time.
///
/// The first failing batch stops the import and is reported as
/// `BatchImportFailure`; batches before it remain committed.
pub async fn import_in_batches<S>(
    sink: &mut S,
    table: &str,
    rows: &[Row],
    batch_size: usize,
) -> Result<u64>
where
    S: BatchSink + ?Sized,
{
    let mut written = 0u64;

    for range in batch_ranges(rows.len(), batch_size) {
        let offset = range.start;
        let len = range.len();
        match sink.write_batch(offset, &rows[range]).await {
            Ok(n) => {
                written += n;
                debug!("{}: committed batch at offset {} ({} rows)", table, offset, n);
            }
            Err(e) => {
                if let MigrateError::BatchImportFailure { .. } = e {
                    return Err(e);
                }
                return Err(MigrateError::batch_failure(table, offset, len, e));
            }
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SqlNullType, SqlValue};

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_batch_ranges() {
        let ranges: Vec<_> = batch_ranges(2500, 1000).collect();
        assert_eq!(ranges, vec![0..1000, 1000..2000, 2000..2500]);

        assert_eq!(batch_ranges(0, 1000).count(), 0);
        assert_eq!(batch_ranges(3, 0).count(), 3);
        assert_eq!(batch_ranges(1000, 1000).collect::<Vec<_>>(), vec![0..1000]);
    }

    #[test]
    fn test_projection_case_insensitive_and_skips() {
        let p = ColumnProjection::resolve(&names(&["A", "b", "C"]), &names(&["c", "a"]));
        assert_eq!(p.columns, names(&["a", "c"]));
        assert_eq!(p.indices, vec![0, 2]);
        assert_eq!(p.skipped, names(&["b"]));

        let row: Row = vec![SqlValue::I32(1), SqlValue::I32(2), SqlValue::I32(3)];
        assert_eq!(p.project(&row), vec![SqlValue::I32(1), SqlValue::I32(3)]);
    }

    #[test]
    fn test_projection_short_row_pads_null() {
        let p = ColumnProjection::resolve(&names(&["A", "B"]), &names(&["A", "B"]));
        let row: Row = vec![SqlValue::I32(1)];
        assert_eq!(
            p.project(&row),
            vec![SqlValue::I32(1), SqlValue::Null(SqlNullType::String)]
        );
    }

    struct FailingSink {
        fail_at: usize,
        committed: Vec<usize>,
    }

    #[async_trait]
    impl BatchSink for FailingSink {
        async fn write_batch(&mut self, offset: usize, rows: &[Row]) -> Result<u64> {
            if offset == self.fail_at {
                return Err(MigrateError::Validation("constraint violated".into()));
            }
            self.committed.push(offset);
            Ok(rows.len() as u64)
        }
    }

    #[tokio::test]
    async fn test_import_in_batches_stops_at_failing_batch() {
        let rows: Vec<Row> = (0..2500).map(|i| vec![SqlValue::I64(i)]).collect();
        let mut sink = FailingSink {
            fail_at: 2000,
            committed: Vec::new(),
        };

        let err = import_in_batches(&mut sink, "Items", &rows, 1000)
            .await
            .unwrap_err();
        assert_eq!(sink.committed, vec![0, 1000]);
        match err {
            MigrateError::BatchImportFailure {
                table,
                offset,
                rows,
                message,
            } => {
                assert_eq!(table, "Items");
                assert_eq!(offset, 2000);
                assert_eq!(rows, 500);
                assert!(message.contains("constraint violated"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_import_in_batches_counts_rows() {
        let rows: Vec<Row> = (0..25).map(|i| vec![SqlValue::I64(i)]).collect();
        let mut sink = FailingSink {
            fail_at: usize::MAX,
            committed: Vec::new(),
        };
        let n = import_in_batches(&mut sink, "Items", &rows, 10).await.unwrap();
        assert_eq!(n, 25);
        assert_eq!(sink.committed, vec![0, 10, 20]);
    }
}
