//! # mssql-migrate
//!
//! Migrate a SQL Server schema and its data into PostgreSQL, MySQL/MariaDB,
//! SQLite or another SQL Server.
//!
//! - **Discovery and export** from SQL Server over TDS (`tiberius`)
//! - **Type mapping** of every source column to the target's native type,
//!   widening columns that hold JSON to unbounded text
//! - **Value coercion** per target engine (booleans, GUIDs, timestamps)
//! - **Batched, transactional import** with an engine-native bulk path
//!   where one exists
//! - **Foreign key suspension** that survives an interrupted run, backed by
//!   an in-database ledger on SQL Server
//! - **CSV staging**: export every table to a directory and import it into
//!   a target later
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_migrate::{Config, Migrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mssql_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let mut migrator = Migrator::new(config);
//!     let result = migrator.run(CancellationToken::new()).await?;
//!     println!("Migrated {} rows", result.rows_imported);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod dialect;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod staging;

// Re-exports for convenient access
pub use config::{Config, CsvConfig, DatabaseConfig, MigrationConfig, TargetConfig};
pub use core::{Importer, Row, SqlNullType, SqlValue, TableInfo, TypeMapper};
pub use drivers::{
    MssqlImporter, MssqlReader, MysqlImporter, PostgresImporter, SqliteImporter, TargetKind,
};
pub use error::{MigrateError, Result};
pub use orchestrator::{
    ExportResult, MigrationResult, Migrator, RunStatus, TableExport, TableReport, TableStatus,
    TableVerification, VerifyStatus,
};
pub use staging::{CsvStage, StagedTable};
