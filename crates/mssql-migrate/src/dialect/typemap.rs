//! Type mapping from SQL Server type descriptors to each target engine.
//!
//! Every mapper strips the nullability suffix, maps the uppercased base type
//! through a fixed table and re-applies the suffix. Columns flagged as
//! special (likely JSON) always become the target's unbounded text type.

use crate::core::schema::split_nullability;
use crate::core::traits::TypeMapper;

/// Base type split into name and parenthesised arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BaseType<'a> {
    name: String,
    args: Option<&'a str>,
}

impl<'a> BaseType<'a> {
    fn parse(base: &'a str) -> Self {
        let base = base.trim();
        match base.find('(') {
            Some(open) => {
                let args = base[open + 1..].trim_end_matches(')').trim();
                BaseType {
                    name: base[..open].trim().to_ascii_uppercase(),
                    args: Some(args),
                }
            }
            None => BaseType {
                name: base.to_ascii_uppercase(),
                args: None,
            },
        }
    }

    /// `(MAX)` or `(-1)`.
    fn is_unbounded(&self) -> bool {
        self.args
            .map(|a| a.eq_ignore_ascii_case("MAX") || a == "-1")
            .unwrap_or(false)
    }

    fn is_binary(&self) -> bool {
        matches!(self.name.as_str(), "BINARY" | "VARBINARY" | "IMAGE")
    }

    /// Arguments as written, e.g. `(255)` or `(18,2)`, empty when absent.
    fn args_suffix(&self) -> String {
        self.args.map(|a| format!("({})", a)).unwrap_or_default()
    }
}

fn with_suffix(target: &str, suffix: &str) -> String {
    format!("{}{}", target, suffix)
}

/// MSSQL → PostgreSQL type mapper.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlToPostgresMapper;

impl TypeMapper for MssqlToPostgresMapper {
    fn target_dialect(&self) -> &str {
        "postgres"
    }

    fn map_type(&self, descriptor: &str, is_special: bool) -> String {
        let (base, suffix) = split_nullability(descriptor);
        if is_special {
            return with_suffix("TEXT", suffix);
        }
        with_suffix(&mssql_to_postgres(&BaseType::parse(base)), suffix)
    }
}

fn mssql_to_postgres(base: &BaseType<'_>) -> String {
    if base.is_unbounded() {
        return if base.is_binary() { "BYTEA" } else { "TEXT" }.to_string();
    }

    match base.name.as_str() {
        "VARCHAR" if base.args.is_some() => format!("VARCHAR{}", base.args_suffix()),
        "CHAR" | "NCHAR" if base.args.is_some() => format!("CHAR{}", base.args_suffix()),
        "VARCHAR" | "NVARCHAR" | "CHAR" | "NCHAR" | "TEXT" | "NTEXT" => "TEXT".to_string(),

        "INT" | "INTEGER" => "INTEGER".to_string(),
        "BIGINT" => "BIGINT".to_string(),
        "SMALLINT" | "TINYINT" => "SMALLINT".to_string(),
        "BIT" => "BOOLEAN".to_string(),

        "DECIMAL" | "NUMERIC" => format!("NUMERIC{}", base.args_suffix()),
        "MONEY" => "NUMERIC(19,4)".to_string(),
        "SMALLMONEY" => "NUMERIC(10,4)".to_string(),
        "FLOAT" => "DOUBLE PRECISION".to_string(),
        "REAL" => "REAL".to_string(),

        "DATETIME" | "DATETIME2" | "SMALLDATETIME" => "TIMESTAMP".to_string(),
        "DATE" => "DATE".to_string(),
        "TIME" => "TIME".to_string(),
        "DATETIMEOFFSET" => "TIMESTAMPTZ".to_string(),

        "UNIQUEIDENTIFIER" => "UUID".to_string(),
        "BINARY" | "VARBINARY" | "IMAGE" => "BYTEA".to_string(),
        "XML" => "XML".to_string(),

        _ => "TEXT".to_string(),
    }
}

/// MSSQL → MySQL/MariaDB type mapper.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlToMysqlMapper;

impl TypeMapper for MssqlToMysqlMapper {
    fn target_dialect(&self) -> &str {
        "mysql"
    }

    fn map_type(&self, descriptor: &str, is_special: bool) -> String {
        let (base, suffix) = split_nullability(descriptor);
        if is_special {
            return with_suffix("LONGTEXT", suffix);
        }
        with_suffix(&mssql_to_mysql(&BaseType::parse(base)), suffix)
    }
}

fn mssql_to_mysql(base: &BaseType<'_>) -> String {
    if base.is_unbounded() {
        return if base.is_binary() { "LONGBLOB" } else { "LONGTEXT" }.to_string();
    }

    match base.name.as_str() {
        "VARCHAR" if base.args.is_some() => format!("VARCHAR{}", base.args_suffix()),
        "CHAR" | "NCHAR" if base.args.is_some() => format!("CHAR{}", base.args_suffix()),

        "INT" | "INTEGER" => "INT".to_string(),
        "BIGINT" => "BIGINT".to_string(),
        "SMALLINT" => "SMALLINT".to_string(),
        "TINYINT" => "TINYINT".to_string(),
        "BIT" => "BOOLEAN".to_string(),

        "DECIMAL" | "NUMERIC" => format!("DECIMAL{}", base.args_suffix()),
        "MONEY" => "DECIMAL(19,4)".to_string(),
        "SMALLMONEY" => "DECIMAL(10,4)".to_string(),
        "FLOAT" => "DOUBLE".to_string(),
        "REAL" => "FLOAT".to_string(),

        "DATETIME" | "DATETIME2" | "SMALLDATETIME" | "DATETIMEOFFSET" => "DATETIME(6)".to_string(),
        "DATE" => "DATE".to_string(),
        "TIME" => "TIME(6)".to_string(),

        "UNIQUEIDENTIFIER" => "CHAR(36)".to_string(),
        "BINARY" | "VARBINARY" | "IMAGE" => "LONGBLOB".to_string(),

        _ => "LONGTEXT".to_string(),
    }
}

/// MSSQL → SQLite type mapper.
///
/// SQLite only has the INTEGER, REAL, TEXT and BLOB storage classes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlToSqliteMapper;

impl TypeMapper for MssqlToSqliteMapper {
    fn target_dialect(&self) -> &str {
        "sqlite"
    }

    fn map_type(&self, descriptor: &str, is_special: bool) -> String {
        let (base, suffix) = split_nullability(descriptor);
        if is_special {
            return with_suffix("TEXT", suffix);
        }

        let parsed = BaseType::parse(base);
        let name = parsed.name.as_str();
        let target = if parsed.is_binary() {
            "BLOB"
        } else if parsed.is_unbounded() {
            "TEXT"
        } else if name.contains("INT") || name.contains("BIT") {
            "INTEGER"
        } else if ["DECIMAL", "NUMERIC", "FLOAT", "REAL", "MONEY"]
            .iter()
            .any(|t| name.contains(t))
        {
            "REAL"
        } else {
            "TEXT"
        };
        with_suffix(target, suffix)
    }
}

/// MSSQL → MSSQL type mapper.
///
/// Source and target share a type system, so the declared type is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlToMssqlMapper;

impl TypeMapper for MssqlToMssqlMapper {
    fn target_dialect(&self) -> &str {
        "mssql"
    }

    fn map_type(&self, descriptor: &str, is_special: bool) -> String {
        let (base, suffix) = split_nullability(descriptor);
        let parsed = BaseType::parse(base);

        let already_unbounded_text = matches!(parsed.name.as_str(), "TEXT" | "NTEXT")
            || (matches!(parsed.name.as_str(), "VARCHAR" | "NVARCHAR") && parsed.is_unbounded());

        let target = if is_special && !already_unbounded_text {
            "NVARCHAR(MAX)".to_string()
        } else if parsed.is_unbounded() {
            format!("{}(MAX)", parsed.name)
        } else {
            format!("{}{}", parsed.name, parsed.args_suffix())
        };
        with_suffix(&target, suffix)
    }
}
