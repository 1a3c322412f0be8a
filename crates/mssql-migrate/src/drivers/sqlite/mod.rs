//! SQLite driver.
//!
//! - [`SqliteImporter`]: file-based target importer

mod importer;

pub use importer::SqliteImporter;
