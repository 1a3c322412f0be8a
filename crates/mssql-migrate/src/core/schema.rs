//! Table metadata handed from the source reader to the importers.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::identifier::validate_or_reject;
use super::traits::TypeMapper;
use crate::error::Result;

/// Nullability suffix of a nullable column descriptor.
pub const NULL_SUFFIX: &str = " NULL";

/// Nullability suffix of a non-nullable column descriptor.
pub const NOT_NULL_SUFFIX: &str = " NOT NULL";

/// Metadata for one exported table.
///
/// `columns` is in declared order and lines up with the slots of every
/// exported row. `column_types` maps each column to its type descriptor,
/// e.g. `"VARCHAR(255) NOT NULL"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table name.
    pub name: String,

    /// Column names in declared order.
    pub columns: Vec<String>,

    /// Column name to type descriptor.
    pub column_types: HashMap<String, String>,

    /// Row count at discovery time.
    pub row_count: i64,
}

impl TableInfo {
    /// Build table metadata from catalog rows, sorted by ordinal position.
    pub fn from_columns(name: impl Into<String>, mut columns: Vec<SourceColumn>, row_count: i64) -> Self {
        columns.sort_by_key(|c| c.ordinal_pos);

        let mut info = TableInfo {
            name: name.into(),
            columns: Vec::with_capacity(columns.len()),
            column_types: HashMap::with_capacity(columns.len()),
            row_count,
        };
        for column in &columns {
            info.columns.push(column.name.clone());
            info.column_types
                .insert(column.name.clone(), build_type_descriptor(column));
        }
        info
    }

    /// Type descriptor of `column`, if the column exists.
    pub fn column_type(&self, column: &str) -> Option<&str> {
        self.column_types.get(column).map(String::as_str)
    }

    /// Descriptors in declared column order; unknown columns yield `""`.
    pub fn ordered_types(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|c| self.column_type(c).unwrap_or(""))
            .collect()
    }
}

/// One column row from the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    /// Column name.
    pub name: String,

    /// Data type as the catalog reports it (e.g., "nvarchar", "decimal").
    pub data_type: String,

    /// Maximum length for string/binary types (-1 for max).
    pub max_length: Option<i32>,

    /// Numeric precision.
    pub precision: Option<u8>,

    /// Numeric scale.
    pub scale: Option<i32>,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Ordinal position (1-based).
    pub ordinal_pos: i32,
}

/// Encode a catalog column as a type descriptor.
///
/// The base type is uppercased. Character and binary types carry their
/// length, with `(MAX)` for the unbounded marker; decimal and numeric carry
/// `(precision,scale)`. The result always ends with exactly one of
/// [`NULL_SUFFIX`] or [`NOT_NULL_SUFFIX`].
pub fn build_type_descriptor(column: &SourceColumn) -> String {
    let data_type = column.data_type.to_lowercase();
    let mut descriptor = data_type.to_uppercase();

    match data_type.as_str() {
        "varchar" | "nvarchar" | "char" | "nchar" | "binary" | "varbinary" => {
            match column.max_length {
                Some(-1) => descriptor.push_str("(MAX)"),
                Some(len) => descriptor.push_str(&format!("({})", len)),
                None => {}
            }
        }
        "decimal" | "numeric" => {
            if let Some(precision) = column.precision {
                descriptor.push_str(&format!("({},{})", precision, column.scale.unwrap_or(0)));
            }
        }
        _ => {}
    }

    descriptor.push_str(if column.is_nullable {
        NULL_SUFFIX
    } else {
        NOT_NULL_SUFFIX
    });
    descriptor
}

/// Split a descriptor into its base type and nullability suffix.
///
/// A descriptor without a recognised suffix is returned whole with an empty
/// suffix.
pub fn split_nullability(descriptor: &str) -> (&str, &str) {
    let trimmed = descriptor.trim_end();
    let upper = trimmed.to_ascii_uppercase();

    if upper.ends_with(NOT_NULL_SUFFIX) {
        let at = trimmed.len() - NOT_NULL_SUFFIX.len();
        (trimmed[..at].trim_end(), NOT_NULL_SUFFIX)
    } else if upper.ends_with(NULL_SUFFIX) {
        let at = trimmed.len() - NULL_SUFFIX.len();
        (trimmed[..at].trim_end(), NULL_SUFFIX)
    } else {
        (trimmed, "")
    }
}

/// Whether `descriptor` declares the SQL Server GUID type.
pub fn is_guid_type(descriptor: &str) -> bool {
    descriptor.to_ascii_uppercase().contains("UNIQUEIDENTIFIER")
}

/// Validate the table name and every column name of `table`.
pub fn validate_table_names(table: &TableInfo) -> Result<()> {
    validate_or_reject(&table.name, "table name")?;
    for column in &table.columns {
        validate_or_reject(column, "column name")?;
    }
    Ok(())
}

/// Render `<quoted column> <target type>` for every column of `table`, in
/// declared order.
///
/// Columns named in `special_columns` (case-insensitive) are mapped as
/// unbounded text.
pub fn column_definitions<Q>(
    table: &TableInfo,
    special_columns: &HashSet<String>,
    mapper: &dyn TypeMapper,
    quote: Q,
) -> Result<Vec<String>>
where
    Q: Fn(&str) -> Result<String>,
{
    validate_table_names(table)?;

    table
        .columns
        .iter()
        .map(|column| {
            let descriptor = table.column_type(column).unwrap_or("");
            let is_special = special_columns
                .iter()
                .any(|s| s.eq_ignore_ascii_case(column));
            Ok(format!(
                "{} {}",
                quote(column)?,
                mapper.map_type(descriptor, is_special)
            ))
        })
        .collect()
}
