//! PostgreSQL driver.
//!
//! - [`PostgresImporter`]: target importer with text `COPY` bulk load

mod importer;

pub use importer::{PostgresImporter, PG_DEFAULT_PORT, PG_DEFAULT_SCHEMA};
