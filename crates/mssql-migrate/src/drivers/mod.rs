//! Database driver implementations.
//!
//! - [`mssql`]: SQL Server source reader, importer and constraint ledger
//! - [`postgres`]: PostgreSQL importer
//! - [`mysql`]: MySQL/MariaDB importer
//! - [`sqlite`]: SQLite importer
//! - [`common`]: Shared utilities (TLS)
//!
//! The target engine is chosen at runtime through [`TargetKind`]; each
//! variant knows its importer, its type mapper and its coercion rules.

pub mod common;
pub mod mssql;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use common::{SslMode, TlsBuilder};
pub use mssql::{MssqlImporter, MssqlReader};
pub use mysql::MysqlImporter;
pub use postgres::PostgresImporter;
pub use sqlite::SqliteImporter;

use crate::config::DatabaseConfig;
use crate::core::traits::{Importer, TypeMapper};
use crate::dialect::{
    CoercionRules, MssqlToMssqlMapper, MssqlToMysqlMapper, MssqlToPostgresMapper,
    MssqlToSqliteMapper,
};
use crate::error::{MigrateError, Result};

/// Target engine discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetKind {
    Postgres,
    MySql,
    Sqlite,
    SqlServer,
}

impl TargetKind {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Postgres => "postgres",
            TargetKind::MySql => "mariadb",
            TargetKind::Sqlite => "sqlite",
            TargetKind::SqlServer => "sqlserver",
        }
    }

    /// Default TCP port, `None` for file-based engines.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            TargetKind::Postgres => Some(5432),
            TargetKind::MySql => Some(3306),
            TargetKind::SqlServer => Some(1433),
            TargetKind::Sqlite => None,
        }
    }

    /// Type mapper for this engine.
    pub fn type_mapper(&self) -> &'static dyn TypeMapper {
        match self {
            TargetKind::Postgres => &MssqlToPostgresMapper,
            TargetKind::MySql => &MssqlToMysqlMapper,
            TargetKind::Sqlite => &MssqlToSqliteMapper,
            TargetKind::SqlServer => &MssqlToMssqlMapper,
        }
    }

    /// Value coercion rules for this engine.
    pub fn coercion_rules(&self) -> CoercionRules {
        match self {
            TargetKind::Postgres => CoercionRules::POSTGRES,
            TargetKind::MySql => CoercionRules::MYSQL,
            TargetKind::Sqlite => CoercionRules::SQLITE,
            TargetKind::SqlServer => CoercionRules::SQLSERVER,
        }
    }

    /// Build a disconnected importer for this engine.
    pub fn create_importer(&self, config: DatabaseConfig) -> Box<dyn Importer> {
        match self {
            TargetKind::Postgres => Box::new(PostgresImporter::new(config)),
            TargetKind::MySql => Box::new(MysqlImporter::new(config)),
            TargetKind::Sqlite => Box::new(SqliteImporter::new(config)),
            TargetKind::SqlServer => Box::new(MssqlImporter::new(config)),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(TargetKind::Postgres),
            "mariadb" | "mysql" => Ok(TargetKind::MySql),
            "sqlite" => Ok(TargetKind::Sqlite),
            "sqlserver" | "mssql" => Ok(TargetKind::SqlServer),
            other => Err(MigrateError::Config(format!(
                "Unknown target type: '{}'. Supported types: postgres, mariadb, sqlite, sqlserver",
                other
            ))),
        }
    }
}

impl TryFrom<String> for TargetKind {
    type Error = MigrateError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TargetKind> for String {
    fn from(kind: TargetKind) -> Self {
        kind.as_str().to_string()
    }
}
