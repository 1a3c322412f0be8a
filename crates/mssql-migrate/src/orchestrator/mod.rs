//! Migration orchestrator - main workflow coordinator.
//!
//! Tables are migrated one after another over the reader's pool and the
//! importer's single session. Foreign keys are suspended once before the
//! first table and resumed once after the last, even when tables fail.
//!
//! The same flow loads a CSV staging directory written by
//! [`Migrator::export_to_csv`], without touching the source database.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::schema::{SourceColumn, TableInfo};
use crate::core::traits::Importer;
use crate::core::value::Row;
use crate::drivers::{MssqlReader, TargetKind};
use crate::error::{MigrateError, Result};
use crate::staging::CsvStage;

/// Outcome of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Success,
    /// Some batches committed before a failure.
    Partial,
    Failed,
    /// The table vanished or was never created on the target.
    Skipped,
}

/// Per-table migration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    pub status: TableStatus,
    /// Row count reported by the source before export.
    pub expected_rows: i64,
    /// Rows written by this run.
    pub imported_rows: u64,
    /// Row count of the target table after import, when it could be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_rows: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableReport {
    fn skipped(table: &str, reason: &MigrateError) -> Self {
        Self {
            table: table.to_string(),
            status: TableStatus::Skipped,
            expected_rows: 0,
            imported_rows: 0,
            target_rows: None,
            error: Some(reason.to_string()),
        }
    }

    /// Build the report for a table whose migration returned `err`.
    ///
    /// A batch failure past offset zero leaves the earlier batches committed,
    /// so the table is `Partial` rather than `Failed`.
    fn from_error(table: &str, expected_rows: i64, err: &MigrateError) -> Self {
        let (status, imported_rows) = match err {
            MigrateError::TableNotFound(_) => return Self::skipped(table, err),
            MigrateError::BatchImportFailure { offset, .. } if *offset > 0 => {
                (TableStatus::Partial, *offset as u64)
            }
            _ => (TableStatus::Failed, 0),
        };
        Self {
            table: table.to_string(),
            status,
            expected_rows,
            imported_rows,
            target_rows: None,
            error: Some(err.to_string()),
        }
    }
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Row count comparison outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Verified,
    Mismatch,
    /// The table does not exist on the target.
    Missing,
}

/// Source and target row counts of one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableVerification {
    pub table: String,
    pub source_rows: i64,
    pub target_rows: Option<i64>,
    pub status: VerifyStatus,
}

impl TableVerification {
    fn new(table: &str, source_rows: i64, target_rows: Option<i64>) -> Self {
        let status = match target_rows {
            None => VerifyStatus::Missing,
            Some(n) if n == source_rows => VerifyStatus::Verified,
            Some(_) => VerifyStatus::Mismatch,
        };
        Self {
            table: table.to_string(),
            source_rows,
            target_rows,
            status,
        }
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    /// Target engine.
    pub target: TargetKind,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub tables_total: usize,
    pub tables_success: usize,
    pub tables_failed: usize,
    pub tables_skipped: usize,

    /// Rows written across all tables.
    pub rows_imported: u64,

    /// One entry per processed table, in migration order.
    pub tables: Vec<TableReport>,

    /// Row count comparison, when verification is enabled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification: Vec<TableVerification>,
}

impl MigrationResult {
    fn new(
        run_id: String,
        target: TargetKind,
        started_at: DateTime<Utc>,
        tables: Vec<TableReport>,
        verification: Vec<TableVerification>,
        cancelled: bool,
    ) -> Self {
        let completed_at = Utc::now();
        let count = |status: TableStatus| tables.iter().filter(|t| t.status == status).count();
        let tables_success = count(TableStatus::Success);
        let tables_failed = count(TableStatus::Failed) + count(TableStatus::Partial);
        let tables_skipped = count(TableStatus::Skipped);
        let mismatched = verification
            .iter()
            .any(|v| v.status != VerifyStatus::Verified);

        let status = if cancelled {
            RunStatus::Cancelled
        } else if tables_failed > 0 || mismatched {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };

        Self {
            run_id,
            status,
            target,
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            tables_total: tables.len(),
            tables_success,
            tables_failed,
            tables_skipped,
            rows_imported: tables.iter().map(|t| t.imported_rows).sum(),
            tables,
            verification,
        }
    }

    /// Names of tables that did not fully migrate.
    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| matches!(t.status, TableStatus::Failed | TableStatus::Partial))
            .map(|t| t.table.as_str())
            .collect()
    }

    /// Convert to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Per-table record of a CSV export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableExport {
    pub table: String,
    pub status: TableStatus,
    /// Rows written to the file.
    pub rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableExport {
    fn from_error(table: &str, err: &MigrateError) -> Self {
        let status = match err {
            MigrateError::TableNotFound(_) => TableStatus::Skipped,
            _ => TableStatus::Failed,
        };
        Self {
            table: table.to_string(),
            status,
            rows: 0,
            path: None,
            error: Some(err.to_string()),
        }
    }
}

/// Result of exporting the source to a CSV staging directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub run_id: String,
    pub status: RunStatus,
    pub output_dir: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub tables_total: usize,
    pub tables_success: usize,
    pub tables_failed: usize,
    pub tables_skipped: usize,
    pub rows_exported: u64,
    pub tables: Vec<TableExport>,
}

impl ExportResult {
    fn new(
        run_id: String,
        output_dir: &Path,
        started_at: DateTime<Utc>,
        tables: Vec<TableExport>,
        cancelled: bool,
    ) -> Self {
        let completed_at = Utc::now();
        let count = |status: TableStatus| tables.iter().filter(|t| t.status == status).count();
        let tables_failed = count(TableStatus::Failed);

        let status = if cancelled {
            RunStatus::Cancelled
        } else if tables_failed > 0 {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };

        Self {
            run_id,
            status,
            output_dir: output_dir.display().to_string(),
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            tables_total: tables.len(),
            tables_success: count(TableStatus::Success),
            tables_failed,
            tables_skipped: count(TableStatus::Skipped),
            rows_exported: tables.iter().map(|t| t.rows).sum(),
            tables,
        }
    }

    /// Names of tables that were not exported.
    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| t.status == TableStatus::Failed)
            .map(|t| t.table.as_str())
            .collect()
    }

    /// Convert to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Where the rows of a run come from.
enum RowSource<'a> {
    Database,
    Staged(&'a CsvStage),
}

/// Metadata for a table created from a CSV header: every column is
/// nullable unbounded text, the importer's coercion does the rest.
fn staged_table_info(table: &str, columns: &[String], row_count: i64) -> TableInfo {
    let columns = columns
        .iter()
        .enumerate()
        .map(|(i, name)| SourceColumn {
            name: name.clone(),
            data_type: "nvarchar".to_string(),
            max_length: Some(-1),
            precision: None,
            scale: None,
            is_nullable: true,
            ordinal_pos: i as i32 + 1,
        })
        .collect();
    TableInfo::from_columns(table, columns, row_count)
}

/// Migration orchestrator.
pub struct Migrator {
    config: Config,
    reader: MssqlReader,
    importer: Box<dyn Importer>,
}

impl Migrator {
    /// Build a migrator with disconnected endpoints.
    pub fn new(config: Config) -> Self {
        let reader = MssqlReader::new(config.source.clone());
        let importer = config.target.kind.create_importer(config.target.db.clone());
        Self {
            config,
            reader,
            importer,
        }
    }

    /// Target engine of this migrator.
    pub fn target_kind(&self) -> TargetKind {
        self.config.target.kind
    }

    /// Open and close a throwaway connection to each endpoint.
    pub async fn health_check(&mut self) -> Result<()> {
        self.reader.test_connection().await?;
        self.importer.test_connection().await?;
        Ok(())
    }

    /// Source tables selected by the configured filters.
    pub async fn list_tables(&mut self) -> Result<Vec<String>> {
        self.reader.connect().await?;
        let tables = self.selected_tables().await;
        self.reader.disconnect().await?;
        tables
    }

    async fn selected_tables(&self) -> Result<Vec<String>> {
        let migration = &self.config.migration;
        let tables = self
            .reader
            .discover_tables(migration.exclude_system_tables)
            .await?;
        let total = tables.len();
        let selected: Vec<String> = tables
            .into_iter()
            .filter(|t| migration.table_selected(t))
            .collect();
        if selected.len() != total {
            info!("Selected {} of {} tables", selected.len(), total);
        }
        Ok(selected)
    }

    async fn connect(&mut self) -> Result<()> {
        self.health_check().await?;
        self.reader.connect().await?;
        self.importer.connect().await?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.importer.disconnect().await {
            warn!("Failed to disconnect from target: {}", e);
        }
        if let Err(e) = self.reader.disconnect().await {
            warn!("Failed to disconnect from source: {}", e);
        }
    }

    /// Run the migration.
    ///
    /// `cancel` is checked before each table; the table in progress always
    /// finishes. Errors that are not scoped to one table abort the run after
    /// foreign keys have been re-enabled.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting migration run {} (target: {})",
            run_id, self.config.target.kind
        );

        self.connect().await?;
        let outcome = match self.selected_tables().await {
            Ok(tables) => self.run_connected(&RowSource::Database, &tables, &cancel).await,
            Err(e) => Err(e),
        };
        self.disconnect().await;

        let (tables, verification, cancelled) = outcome?;
        let result = MigrationResult::new(
            run_id,
            self.config.target.kind,
            started_at,
            tables,
            verification,
            cancelled,
        );
        info!(
            "Migration {}: {} tables, {} rows in {:.1}s",
            result.status, result.tables_total, result.rows_imported, result.duration_seconds
        );
        Ok(result)
    }

    async fn run_connected(
        &mut self,
        source: &RowSource<'_>,
        tables: &[String],
        cancel: &CancellationToken,
    ) -> Result<(Vec<TableReport>, Vec<TableVerification>, bool)> {
        info!("Migrating {} tables", tables.len());

        self.importer.disable_foreign_keys().await?;

        let mut reports = Vec::with_capacity(tables.len());
        let mut cancelled = false;
        let mut abort: Option<MigrateError> = None;

        for (i, table) in tables.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Cancellation requested; stopping before {}", table);
                cancelled = true;
                break;
            }
            info!("[{}/{}] {}", i + 1, tables.len(), table);

            let outcome = match source {
                RowSource::Database => self.migrate_table(table).await,
                RowSource::Staged(stage) => self.import_staged_table(stage, table).await,
            };
            match outcome {
                Ok(report) => reports.push(report),
                Err((expected, e)) if e.is_table_scoped() => {
                    error!("{}: {}", table, e);
                    reports.push(TableReport::from_error(table, expected, &e));
                }
                Err((_, e)) => {
                    error!("{}: aborting run: {}", table, e);
                    abort = Some(e);
                    break;
                }
            }
        }

        let enabled = self.importer.enable_foreign_keys().await;
        if let Some(e) = abort {
            if let Err(enable_err) = enabled {
                error!("Failed to re-enable foreign keys: {}", enable_err);
            }
            return Err(e);
        }
        enabled?;

        let verification = if self.config.migration.verify && !cancelled {
            let migrated: Vec<String> = reports
                .iter()
                .filter(|r| r.status != TableStatus::Skipped)
                .map(|r| r.table.clone())
                .collect();
            self.verify_tables(source, &migrated).await?
        } else {
            Vec::new()
        };

        Ok((reports, verification, cancelled))
    }

    /// Migrate one table. The error carries the source row count when it
    /// was already known.
    async fn migrate_table(
        &mut self,
        table: &str,
    ) -> std::result::Result<TableReport, (i64, MigrateError)> {
        let migration = self.config.migration.clone();

        let info = self.reader.get_table_info(table).await.map_err(|e| (0, e))?;
        let expected = info.row_count;
        let fail = |e: MigrateError| (expected, e);

        let special = self
            .reader
            .identify_json_columns(table, migration.json_sample_size)
            .await
            .map_err(fail)?;
        if !special.is_empty() {
            debug!("{}: JSON-like columns {:?}", table, special);
        }

        if migration.drop_existing {
            self.importer.drop_table(table).await.map_err(fail)?;
        }
        if migration.create_tables && !self.importer.table_exists(table).await.map_err(fail)? {
            self.importer
                .create_table_from_schema(&info, &special)
                .await
                .map_err(fail)?;
        }

        let (columns, rows) = self
            .reader
            .export_table_data(table, migration.batch_size)
            .await
            .map_err(fail)?;

        let imported = self.load_rows(table, &columns, &rows).await.map_err(fail)?;
        let target_rows = self.importer.row_count(table).await.map_err(fail)?;

        Ok(TableReport {
            table: table.to_string(),
            status: TableStatus::Success,
            expected_rows: expected,
            imported_rows: imported,
            target_rows: Some(target_rows),
            error: None,
        })
    }

    /// Import through the bulk path when configured and available.
    async fn load_rows(&mut self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64> {
        let batch_size = self.config.migration.batch_size;
        if self.config.migration.use_bulk && self.importer.supports_bulk_import() {
            self.importer
                .import_rows_bulk(table, columns, rows, batch_size)
                .await
        } else {
            self.importer
                .import_rows(table, columns, rows, batch_size)
                .await
        }
    }

    /// Load one staged CSV file. A table missing on the target is skipped
    /// unless `create_tables` is set.
    async fn import_staged_table(
        &mut self,
        stage: &CsvStage,
        table: &str,
    ) -> std::result::Result<TableReport, (i64, MigrateError)> {
        let migration = self.config.migration.clone();

        let staged = stage
            .read_table(&stage.table_path(table))
            .map_err(|e| (0, e))?;
        let expected = staged.rows.len() as i64;
        let fail = |e: MigrateError| (expected, e);

        let mut exists = self.importer.table_exists(table).await.map_err(fail)?;
        let columns = if staged.columns.is_empty() {
            // Headerless files line up with the existing target columns.
            if !exists {
                return Err(fail(MigrateError::Validation(format!(
                    "{}: file has no header record and the target table does not exist",
                    table
                ))));
            }
            self.importer.get_columns(table).await.map_err(fail)?
        } else {
            staged.columns
        };

        if migration.drop_existing && exists {
            self.importer.drop_table(table).await.map_err(fail)?;
            exists = false;
        }
        if !exists {
            if !migration.create_tables {
                return Err(fail(MigrateError::TableNotFound(table.to_string())));
            }
            let info = staged_table_info(table, &columns, expected);
            self.importer
                .create_table_from_schema(&info, &HashSet::new())
                .await
                .map_err(fail)?;
        }

        let imported = self
            .load_rows(table, &columns, &staged.rows)
            .await
            .map_err(fail)?;
        let target_rows = self.importer.row_count(table).await.map_err(fail)?;

        Ok(TableReport {
            table: table.to_string(),
            status: TableStatus::Success,
            expected_rows: expected,
            imported_rows: imported,
            target_rows: Some(target_rows),
            error: None,
        })
    }

    async fn verify_tables(
        &mut self,
        source: &RowSource<'_>,
        tables: &[String],
    ) -> Result<Vec<TableVerification>> {
        let mut results = Vec::with_capacity(tables.len());
        for table in tables {
            let source_rows = match source {
                RowSource::Database => self.reader.get_table_info(table).await?.row_count,
                RowSource::Staged(stage) => stage.count_records(&stage.table_path(table))? as i64,
            };
            let target_rows = if self.importer.table_exists(table).await? {
                Some(self.importer.row_count(table).await?)
            } else {
                None
            };
            let verification = TableVerification::new(table, source_rows, target_rows);
            match verification.status {
                VerifyStatus::Verified => debug!("{}: {} rows verified", table, source_rows),
                VerifyStatus::Mismatch => warn!(
                    "{}: row count mismatch (source {}, target {:?})",
                    table, source_rows, target_rows
                ),
                VerifyStatus::Missing => warn!("{}: missing on target", table),
            }
            results.push(verification);
        }
        Ok(results)
    }

    /// Compare source and target row counts of every selected table
    /// without migrating anything.
    pub async fn verify(&mut self) -> Result<Vec<TableVerification>> {
        self.reader.connect().await?;
        self.importer.connect().await?;
        let result = match self.selected_tables().await {
            Ok(tables) => self.verify_tables(&RowSource::Database, &tables).await,
            Err(e) => Err(e),
        };
        self.disconnect().await;
        result
    }

    /// Export every selected source table to the CSV staging directory.
    ///
    /// Only the source is contacted. Each file is re-read after writing and
    /// its record count checked against the exported rows.
    pub async fn export_to_csv(&mut self, cancel: CancellationToken) -> Result<ExportResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let stage = CsvStage::new(self.config.csv.clone());
        info!(
            "Starting export run {} to {}",
            run_id,
            stage.dir().display()
        );

        self.reader.test_connection().await?;
        self.reader.connect().await?;
        let outcome = self.export_connected(&stage, &cancel).await;
        if let Err(e) = self.reader.disconnect().await {
            warn!("Failed to disconnect from source: {}", e);
        }

        let (tables, cancelled) = outcome?;
        let result = ExportResult::new(run_id, stage.dir(), started_at, tables, cancelled);
        info!(
            "Export {}: {} tables, {} rows in {:.1}s",
            result.status, result.tables_total, result.rows_exported, result.duration_seconds
        );
        Ok(result)
    }

    async fn export_connected(
        &mut self,
        stage: &CsvStage,
        cancel: &CancellationToken,
    ) -> Result<(Vec<TableExport>, bool)> {
        let tables = self.selected_tables().await?;
        info!("Exporting {} tables to CSV", tables.len());

        let mut exports = Vec::with_capacity(tables.len());
        for (i, table) in tables.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Cancellation requested; stopping before {}", table);
                return Ok((exports, true));
            }
            info!("[{}/{}] {}", i + 1, tables.len(), table);

            match self.export_table(stage, table).await {
                Ok(export) => exports.push(export),
                Err(e) if e.is_table_scoped() => {
                    error!("{}: {}", table, e);
                    exports.push(TableExport::from_error(table, &e));
                }
                Err(e) => {
                    error!("{}: aborting export: {}", table, e);
                    return Err(e);
                }
            }
        }
        Ok((exports, false))
    }

    async fn export_table(&self, stage: &CsvStage, table: &str) -> Result<TableExport> {
        let migration = &self.config.migration;
        let (columns, rows) = self
            .reader
            .export_table_data(table, migration.batch_size)
            .await?;
        let special = self
            .reader
            .identify_json_columns(table, migration.json_sample_size)
            .await?;

        let path = stage.export_table(table, &columns, &rows, &special)?;
        let written = rows.len() as u64;
        if !stage.validate_export(written, &path)? {
            return Err(MigrateError::Validation(format!(
                "{}: export validation failed for {}",
                table,
                path.display()
            )));
        }

        Ok(TableExport {
            table: table.to_string(),
            status: TableStatus::Success,
            rows: written,
            path: Some(path.display().to_string()),
            error: None,
        })
    }

    /// Load the CSV staging directory into the target.
    ///
    /// Tables are the `.csv` files of the directory that pass the table
    /// filters, in name order. The source database is never contacted;
    /// verification compares each file's record count with the target.
    pub async fn import_from_csv(&mut self, cancel: CancellationToken) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let stage = CsvStage::new(self.config.csv.clone());
        info!(
            "Starting CSV import run {} from {} (target: {})",
            run_id,
            stage.dir().display(),
            self.config.target.kind
        );

        let tables: Vec<String> = stage
            .list_tables()?
            .into_iter()
            .filter(|t| self.config.migration.table_selected(t))
            .collect();

        self.importer.test_connection().await?;
        self.importer.connect().await?;
        let outcome = self
            .run_connected(&RowSource::Staged(&stage), &tables, &cancel)
            .await;
        if let Err(e) = self.importer.disconnect().await {
            warn!("Failed to disconnect from target: {}", e);
        }

        let (tables, verification, cancelled) = outcome?;
        let result = MigrationResult::new(
            run_id,
            self.config.target.kind,
            started_at,
            tables,
            verification,
            cancelled,
        );
        info!(
            "CSV import {}: {} tables, {} rows in {:.1}s",
            result.status, result.tables_total, result.rows_imported, result.duration_seconds
        );
        Ok(result)
    }
}
