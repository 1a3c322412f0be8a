//! Core abstractions shared by the source reader and every importer.
//!
//! - [`identifier`]: identifier validation and quoting
//! - [`schema`]: table metadata and type descriptors
//! - [`value`]: row value representation
//! - [`batch`]: batch splitting, column projection and the batch driver
//! - [`traits`]: the importer contract and the type mapper trait

pub mod batch;
pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use batch::{batch_ranges, import_in_batches, BatchSink, ColumnProjection};
pub use identifier::validate_or_reject;
pub use schema::{build_type_descriptor, split_nullability, SourceColumn, TableInfo};
pub use traits::{Importer, TypeMapper};
pub use value::{Row, SqlNullType, SqlValue};
