//! Configuration validation.

use super::{Config, CsvConfig, DatabaseConfig};
use crate::drivers::common::SslMode;
use crate::drivers::TargetKind;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_server("source", &config.source)?;

    match config.target.kind {
        TargetKind::Sqlite => {
            if config.target.db.database.is_empty() {
                return Err(MigrateError::Config(
                    "target.database (SQLite file path) is required".into(),
                ));
            }
        }
        _ => validate_server("target", &config.target.db)?,
    }
    config.target.db.ssl_mode.parse::<SslMode>()?;

    if config.migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if config.migration.json_sample_size == 0 {
        return Err(MigrateError::Config(
            "migration.json_sample_size must be at least 1".into(),
        ));
    }

    validate_csv(&config.csv)
}

fn validate_csv(csv: &CsvConfig) -> Result<()> {
    for (field, delimiter) in [
        ("delimiter", csv.delimiter),
        ("fallback_delimiter", csv.fallback_delimiter),
    ] {
        if !delimiter.is_ascii() || delimiter == '"' || delimiter == '\n' || delimiter == '\r' {
            return Err(MigrateError::Config(format!(
                "csv.{} must be a single ASCII character other than a quote or newline",
                field
            )));
        }
    }
    if csv.delimiter == csv.fallback_delimiter {
        return Err(MigrateError::Config(
            "csv.fallback_delimiter must differ from csv.delimiter".into(),
        ));
    }
    if csv.output_dir.as_os_str().is_empty() {
        return Err(MigrateError::Config("csv.output_dir is required".into()));
    }
    Ok(())
}

fn validate_server(side: &str, db: &DatabaseConfig) -> Result<()> {
    if db.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", side)));
    }
    if db.database.is_empty() {
        return Err(MigrateError::Config(format!("{}.database is required", side)));
    }
    if db.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", side)));
    }
    Ok(())
}
