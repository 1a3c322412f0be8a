//! Microsoft SQL Server driver.
//!
//! - [`MssqlReader`]: source reader (discovery, metadata, export, JSON sampling)
//! - [`MssqlImporter`]: target importer with TDS bulk load
//! - [`ledger`]: constraint tracking ledger used to suspend foreign keys
//! - [`TiberiusConnectionManager`]: connection factory shared by both sides

mod connection;
mod importer;
pub mod ledger;
mod reader;

pub use connection::{MssqlClient, TiberiusConnectionManager, MSSQL_DEFAULT_PORT, MSSQL_DEFAULT_SCHEMA};
pub use importer::MssqlImporter;
pub use ledger::{LedgerState, LedgerStore, MssqlLedgerStore};
pub use reader::{
    canonicalize_guid_columns, classify_json_columns, looks_like_json, MssqlReader, JSON_THRESHOLD,
};
