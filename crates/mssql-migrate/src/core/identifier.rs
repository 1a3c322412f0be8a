//! Identifier validation and quoting for generated SQL.
//!
//! Table and column names discovered from a catalog end up spliced into
//! DDL, INSERT column lists and bulk-load statements. Only data values can be
//! bound as parameters, so every name goes through [`validate_or_reject`]
//! before it is quoted.
//!
//! The accepted grammar is the intersection of what all four target engines
//! take unquoted: an ASCII letter or underscore, followed by ASCII letters,
//! digits or underscores, at most [`MAX_IDENTIFIER_LENGTH`] characters long.
//! Quote characters, semicolons, whitespace and comment sequences therefore
//! never reach a statement.

use crate::error::{MigrateError, Result};

/// Maximum identifier length.
/// - PostgreSQL: 63 bytes
/// - SQL Server: 128 characters
/// - MySQL: 64 characters
///
/// PostgreSQL silently truncates longer names instead of failing, so the
/// SQL Server limit is used and truncation is left to the target.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Check `identifier` against the identifier grammar.
///
/// `context` names what the identifier is ("table name", "column name") and
/// is carried in the error.
///
/// # Errors
///
/// Returns [`MigrateError::InvalidIdentifier`] when the name is empty, too
/// long, or contains any character outside `[A-Za-z0-9_]`, or starts with a
/// digit.
pub fn validate_or_reject(identifier: &str, context: &str) -> Result<()> {
    if is_valid_identifier(identifier) {
        Ok(())
    } else {
        Err(MigrateError::invalid_identifier(identifier, context))
    }
}

/// Non-failing form of [`validate_or_reject`].
pub fn is_valid_identifier(identifier: &str) -> bool {
    if identifier.is_empty() || identifier.len() > MAX_IDENTIFIER_LENGTH {
        return false;
    }

    let mut chars = identifier.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate every name in `identifiers`, stopping at the first failure.
pub fn validate_all<'a, I>(identifiers: I, context: &str) -> Result<()>
where
    I: IntoIterator<Item = &'a String>,
{
    for identifier in identifiers {
        validate_or_reject(identifier, context)?;
    }
    Ok(())
}

/// Quote a PostgreSQL or SQLite identifier with double quotes.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_or_reject(name, "identifier")?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a MySQL identifier using backticks.
pub fn quote_mysql(name: &str) -> Result<String> {
    validate_or_reject(name, "identifier")?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Quote a SQL Server identifier using brackets.
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_or_reject(name, "identifier")?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Qualify a PostgreSQL table name with schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Qualify a SQL Server table name with schema.
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}
