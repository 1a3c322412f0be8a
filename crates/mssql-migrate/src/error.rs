//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network or authentication failure while opening a session.
    #[error("Connection to {engine} failed: {message}")]
    ConnectionFailure { engine: String, message: String },

    /// A table or column name failed identifier validation.
    #[error("Invalid {context} {identifier:?}: only letters, digits and underscores are allowed")]
    InvalidIdentifier { identifier: String, context: String },

    /// The catalog returned no columns for a table.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// One transactional batch failed; earlier batches stay committed.
    #[error("Import into {table} failed in batch at row offset {offset} ({rows} rows): {message}")]
    BatchImportFailure {
        table: String,
        offset: usize,
        rows: usize,
        message: String,
    },

    /// Disabling or re-enabling an individual constraint failed.
    #[error("Constraint operation on {constraint} failed: {message}")]
    ConstraintOperationFailure { constraint: String, message: String },

    /// An operation was attempted before `connect`.
    #[error("Not connected to {0}")]
    NotConnected(&'static str),

    /// SQL Server driver error
    #[error("SQL Server error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL/MariaDB driver error
    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// SQLite driver error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Row count validation failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing a staged CSV file failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a ConnectionFailure error for the named engine.
    pub fn connection(engine: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::ConnectionFailure {
            engine: engine.into(),
            message: message.to_string(),
        }
    }

    /// Create an InvalidIdentifier error.
    pub fn invalid_identifier(identifier: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::InvalidIdentifier {
            identifier: identifier.into(),
            context: context.into(),
        }
    }

    /// Wrap the failure of one batch with its position in the table.
    pub fn batch_failure(
        table: impl Into<String>,
        offset: usize,
        rows: usize,
        cause: impl ToString,
    ) -> Self {
        MigrateError::BatchImportFailure {
            table: table.into(),
            offset,
            rows,
            message: cause.to_string(),
        }
    }

    /// Create a ConstraintOperationFailure error.
    pub fn constraint(constraint: impl Into<String>, cause: impl ToString) -> Self {
        MigrateError::ConstraintOperationFailure {
            constraint: constraint.into(),
            message: cause.to_string(),
        }
    }

    /// Whether the orchestrator may skip the table and keep going.
    pub fn is_table_scoped(&self) -> bool {
        !matches!(
            self,
            MigrateError::ConnectionFailure { .. }
                | MigrateError::InvalidIdentifier { .. }
                | MigrateError::NotConnected(_)
                | MigrateError::Config(_)
                | MigrateError::Cancelled
        )
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::ConnectionFailure { .. }
            | MigrateError::Pool { .. }
            | MigrateError::NotConnected(_) => 3,
            MigrateError::InvalidIdentifier { .. } => 4,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_failure_message_names_table_and_offset() {
        let err = MigrateError::batch_failure("Users", 2000, 500, "duplicate key");
        let msg = err.to_string();
        assert!(msg.contains("Users"));
        assert!(msg.contains("2000"));
        assert!(msg.contains("duplicate key"));
    }

    #[test]
    fn test_invalid_identifier_message() {
        let err = MigrateError::invalid_identifier("bad;name", "table name");
        assert!(err.to_string().contains("table name"));
        assert!(err.to_string().contains("bad;name"));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_table_scoped_errors() {
        assert!(MigrateError::TableNotFound("t".into()).is_table_scoped());
        assert!(MigrateError::batch_failure("t", 0, 1, "x").is_table_scoped());
        assert!(!MigrateError::connection("postgres", "refused").is_table_scoped());
        assert!(!MigrateError::invalid_identifier("a b", "column name").is_table_scoped());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 2);
        assert_eq!(MigrateError::connection("mssql", "x").exit_code(), 3);
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);
        assert_eq!(MigrateError::Validation("x".into()).exit_code(), 1);
    }
}
