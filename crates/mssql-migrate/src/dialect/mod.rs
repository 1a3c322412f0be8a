//! Type mapping and value coercion per target engine.
//!
//! # Available Mappers
//!
//! - [`MssqlToPostgresMapper`]: MSSQL → PostgreSQL
//! - [`MssqlToMysqlMapper`]: MSSQL → MySQL/MariaDB
//! - [`MssqlToSqliteMapper`]: MSSQL → SQLite
//! - [`MssqlToMssqlMapper`]: MSSQL → MSSQL (passthrough)
//!
//! Coercion rules for each engine live in [`CoercionRules`].

pub mod coerce;
mod typemap;

pub use coerce::{coerce_row, coerce_value, CoercionRules};
pub use typemap::{MssqlToMssqlMapper, MssqlToMysqlMapper, MssqlToPostgresMapper, MssqlToSqliteMapper};
