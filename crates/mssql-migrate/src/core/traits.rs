//! Core traits for the migration engine.
//!
//! - [`Importer`]: the capability set every target backend implements
//! - [`TypeMapper`]: maps source type descriptors to target-native types
//!
//! Backends are selected at runtime through [`TargetKind`]; there is no
//! shared base implementation beyond the default methods below.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::drivers::TargetKind;
use crate::error::Result;

use super::schema::TableInfo;
use super::value::Row;

/// Write schema and data into one target engine.
///
/// Every importer owns exactly one dedicated session, opened by
/// [`connect`](Importer::connect). Session-scoped settings (foreign key
/// checks, identity insert, SQL mode) therefore stay in force between calls.
/// Every operation other than `connect`, `disconnect` and `test_connection`
/// fails with [`MigrateError::NotConnected`](crate::MigrateError::NotConnected)
/// before `connect` succeeds.
#[async_trait]
pub trait Importer: Send {
    /// Target engine this importer writes to.
    fn kind(&self) -> TargetKind;

    /// Open the session. Calling it on a connected importer is a no-op.
    async fn connect(&mut self) -> Result<()>;

    /// Close the session. Calling it on a disconnected importer is a no-op.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether a session is currently open.
    fn is_connected(&self) -> bool;

    /// Open a separate connection, run a trivial query and close it.
    async fn test_connection(&mut self) -> Result<()>;

    /// Check if a table exists in the configured schema.
    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Create the table if it does not exist yet.
    ///
    /// Columns named in `special_columns` are forced to the engine's
    /// unbounded text type. All names are validated before any statement is
    /// sent.
    async fn create_table_from_schema(
        &mut self,
        table: &TableInfo,
        special_columns: &HashSet<String>,
    ) -> Result<()>;

    /// Column names of `table` as the target engine reports them.
    async fn get_columns(&mut self, table: &str) -> Result<Vec<String>>;

    /// Insert `rows` using batched parameterized statements.
    ///
    /// `columns` names the slots of each row. Columns without a counterpart
    /// in the target are dropped with a warning. Every batch of `batch_size`
    /// rows commits in its own transaction; a failing batch is rolled back and
    /// reported as `BatchImportFailure`, leaving earlier batches committed.
    ///
    /// Returns the number of rows written.
    async fn import_rows(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
        batch_size: usize,
    ) -> Result<u64>;

    /// Whether [`import_rows_bulk`](Importer::import_rows_bulk) uses an
    /// engine-native loader.
    fn supports_bulk_import(&self) -> bool {
        false
    }

    /// Engine-native fast path. Commits the same rows as `import_rows`.
    async fn import_rows_bulk(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
        batch_size: usize,
    ) -> Result<u64> {
        self.import_rows(table, columns, rows, batch_size).await
    }

    /// Drop a table. Dropping a table that does not exist is a no-op.
    async fn drop_table(&mut self, table: &str) -> Result<()>;

    /// Get the row count for a table.
    async fn row_count(&mut self, table: &str) -> Result<i64>;

    /// Suspend foreign key enforcement for the rest of the run.
    async fn disable_foreign_keys(&mut self) -> Result<()>;

    /// Resume foreign key enforcement.
    async fn enable_foreign_keys(&mut self) -> Result<()>;
}

/// Maps source type descriptors to target-native column types.
///
/// Implementations are pure: the same `(descriptor, is_special)` pair always
/// yields the same type string.
pub trait TypeMapper: Send + Sync {
    /// Get the target dialect name.
    fn target_dialect(&self) -> &str;

    /// Map a type descriptor such as `"NVARCHAR(50) NOT NULL"`.
    ///
    /// The nullability suffix of the descriptor is carried over to the
    /// result. `is_special` forces the unbounded text type.
    fn map_type(&self, descriptor: &str, is_special: bool) -> String;
}
