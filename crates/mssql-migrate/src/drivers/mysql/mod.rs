//! MySQL/MariaDB driver.
//!
//! - [`MysqlImporter`]: target importer over a single `mysql_async` session
//!
//! Supported versions: MySQL 5.7+, 8.0+ and MariaDB 10.2+.

mod importer;

pub use importer::{MysqlImporter, MYSQL_DEFAULT_PORT};
