//! Utilities shared by several drivers.
//!
//! - [`tls`]: TLS settings for the PostgreSQL and MySQL importers

pub mod tls;

pub use tls::{SslMode, TlsBuilder};
