//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::drivers::TargetKind;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database (SQL Server).
    pub source: DatabaseConfig,

    /// Target database and engine.
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// CSV staging directory used by `export` and `import`.
    #[serde(default)]
    pub csv: CsvConfig,
}

/// One connection target.
///
/// For SQLite `database` is the file path and host, port and user are
/// ignored.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Database host.
    #[serde(default)]
    pub host: String,

    /// Database port. Zero selects the engine default.
    #[serde(default)]
    pub port: u16,

    /// Database name, or file path for SQLite.
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password. Never serialized.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Schema (default: `dbo` for SQL Server, `public` for PostgreSQL, the
    /// database itself for MySQL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// TLS mode for PostgreSQL and MySQL (default: "disable").
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// Encrypt the SQL Server connection (default: false).
    #[serde(default)]
    pub encrypt: bool,

    /// Trust the SQL Server certificate without validation (default: true).
    #[serde(default = "default_true")]
    pub trust_server_cert: bool,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

impl DatabaseConfig {
    /// Port, falling back to `default` when unset.
    pub fn port_or(&self, default: u16) -> u16 {
        if self.port == 0 {
            default
        } else {
            self.port
        }
    }

    /// Schema, falling back to `default` when unset or blank.
    pub fn schema_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.schema.as_deref() {
            Some(s) if !s.trim().is_empty() => s,
            _ => default,
        }
    }
}

/// Target database with its engine discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target engine.
    #[serde(rename = "type", alias = "kind")]
    pub kind: TargetKind,

    /// Connection settings.
    #[serde(flatten)]
    pub db: DatabaseConfig,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows per transactional batch (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Use the engine-native bulk loader when the importer has one (default: true).
    #[serde(default = "default_true")]
    pub use_bulk: bool,

    /// Skip SQL Server bookkeeping tables (default: true).
    #[serde(default = "default_true")]
    pub exclude_system_tables: bool,

    /// Rows sampled per table for JSON detection (default: 100).
    #[serde(default = "default_json_sample_size")]
    pub json_sample_size: usize,

    /// Create missing target tables (default: true).
    #[serde(default = "default_true")]
    pub create_tables: bool,

    /// Drop target tables before creating them (default: false).
    #[serde(default)]
    pub drop_existing: bool,

    /// Compare source and target row counts after the run (default: true).
    #[serde(default = "default_true")]
    pub verify: bool,

    /// Only migrate these tables (case-insensitive). Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_tables: Vec<String>,

    /// Never migrate these tables (case-insensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tables: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            use_bulk: true,
            exclude_system_tables: true,
            json_sample_size: default_json_sample_size(),
            create_tables: true,
            drop_existing: false,
            verify: true,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
        }
    }
}

impl MigrationConfig {
    /// Whether `table` passes the include and exclude filters.
    pub fn table_selected(&self, table: &str) -> bool {
        let included = self.include_tables.is_empty()
            || self
                .include_tables
                .iter()
                .any(|t| t.eq_ignore_ascii_case(table));
        let excluded = self
            .exclude_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table));
        included && !excluded
    }
}

/// CSV staging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvConfig {
    /// Directory holding one `<table>.csv` per table (default: "csv_export").
    #[serde(default = "default_csv_dir")]
    pub output_dir: PathBuf,

    /// Field delimiter (default: ",").
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Delimiter used when JSON columns contain the primary one (default: "|").
    #[serde(default = "default_fallback_delimiter")]
    pub fallback_delimiter: char,

    /// Write a header record with the column names (default: true).
    #[serde(default = "default_true")]
    pub include_headers: bool,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            output_dir: default_csv_dir(),
            delimiter: default_delimiter(),
            fallback_delimiter: default_fallback_delimiter(),
            include_headers: true,
        }
    }
}

fn default_csv_dir() -> PathBuf {
    PathBuf::from("csv_export")
}

fn default_delimiter() -> char {
    ','
}

fn default_fallback_delimiter() -> char {
    '|'
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    1000
}

fn default_json_sample_size() -> usize {
    100
}
