//! SQL Server source reader.
//!
//! Discovers base tables, describes their columns and exports their rows as
//! positional [`Row`]s. The reader keeps one session open between
//! `connect` and `disconnect`; every query runs on it in sequence.

use std::borrow::Cow;
use std::collections::HashSet;

use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use tiberius::Row as TdsRow;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{self, TiberiusConnectionManager, MSSQL_DEFAULT_SCHEMA};
use crate::config::DatabaseConfig;
use crate::core::identifier::{qualify_mssql, quote_mssql, validate_all, validate_or_reject};
use crate::core::schema::{is_guid_type, SourceColumn, TableInfo};
use crate::core::value::{Row, SqlNullType, SqlValue};
use crate::error::{MigrateError, Result};

/// SQL Server bookkeeping tables skipped by discovery.
const SYSTEM_TABLES: &[&str] = &["sysdiagrams", "__EFMigrationsHistory", "_MigrationDisabledConstraint"];

/// Types the driver cannot decode, cast server-side to text.
const TEXT_CAST_TYPES: &[&str] = &["xml", "sql_variant", "hierarchyid", "geography", "geometry"];

/// Money types, cast server-side to an exact decimal.
const MONEY_TYPES: &[&str] = &["money", "smallmoney"];

/// Fraction of sampled non-null values that must look like JSON.
pub const JSON_THRESHOLD: f64 = 0.5;

/// SQL Server source reader.
pub struct MssqlReader {
    config: DatabaseConfig,
    schema: String,
    pool: Option<Pool<TiberiusConnectionManager>>,
}

impl MssqlReader {
    /// Create a disconnected reader.
    pub fn new(config: DatabaseConfig) -> Self {
        let schema = config.schema_or(MSSQL_DEFAULT_SCHEMA).to_string();
        Self {
            config,
            schema,
            pool: None,
        }
    }

    /// Schema tables are discovered in.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Open the session. A second call is a no-op.
    pub async fn connect(&mut self) -> Result<()> {
        if self.pool.is_some() {
            return Ok(());
        }
        validate_or_reject(&self.schema, "schema name")?;

        let manager = TiberiusConnectionManager::new(self.config.clone());
        let target = manager.describe();
        let pool = manager.single_session_pool().await?;

        // Prove the session before reporting success.
        pool.get()
            .await
            .map_err(|e| MigrateError::connection("sqlserver", format!("{}: {}", target, e)))?;

        info!("Connected to MSSQL: {}", target);
        self.pool = Some(pool);
        Ok(())
    }

    /// Close the session. A no-op when not connected.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.pool.take().is_some() {
            debug!("Disconnected from MSSQL source");
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_some()
    }

    /// Open a separate connection, run `SELECT 1` and close it.
    pub async fn test_connection(&self) -> Result<()> {
        connection::check_connection(&self.config).await?;
        info!("MSSQL source connection OK");
        Ok(())
    }

    async fn client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        let pool = self.pool.as_ref().ok_or(MigrateError::NotConnected("sqlserver source"))?;
        pool.get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting MSSQL source connection"))
    }

    /// List base tables in the configured schema, sorted by name.
    ///
    /// With `exclude_system_tables` the SQL Server bookkeeping tables are
    /// dropped. Every returned name has passed identifier validation.
    pub async fn discover_tables(&self, exclude_system_tables: bool) -> Result<Vec<String>> {
        let mut client = self.client().await?;

        let query = r#"
            SELECT TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = @P1
            ORDER BY TABLE_NAME
        "#;
        let rows = client
            .query(query, &[&self.schema.as_str()])
            .await?
            .into_first_result()
            .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name: &str = row.try_get(0)?.unwrap_or_default();
            if exclude_system_tables && is_system_table(name) {
                debug!("Skipping system table {}", name);
                continue;
            }
            tables.push(name.to_string());
        }
        tables.sort();
        validate_all(&tables, "table name")?;

        info!("Discovered {} tables in schema {}", tables.len(), self.schema);
        Ok(tables)
    }

    async fn load_columns(&self, table: &str) -> Result<Vec<SourceColumn>> {
        validate_or_reject(table, "table name")?;
        let mut client = self.client().await?;

        let query = r#"
            SELECT
                COLUMN_NAME,
                DATA_TYPE,
                CHARACTER_MAXIMUM_LENGTH,
                NUMERIC_PRECISION,
                NUMERIC_SCALE,
                IS_NULLABLE,
                ORDINAL_POSITION
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
            ORDER BY ORDINAL_POSITION
        "#;
        let rows = client
            .query(query, &[&self.schema.as_str(), &table])
            .await?
            .into_first_result()
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: &str = row.try_get(0)?.unwrap_or_default();
            let data_type: &str = row.try_get(1)?.unwrap_or_default();
            let is_nullable: &str = row.try_get(5)?.unwrap_or("YES");
            columns.push(SourceColumn {
                name: name.to_string(),
                data_type: data_type.to_string(),
                max_length: row.try_get::<i32, _>(2)?,
                precision: row.try_get::<u8, _>(3)?,
                scale: row.try_get::<i32, _>(4)?,
                is_nullable: is_nullable.eq_ignore_ascii_case("YES"),
                ordinal_pos: row.try_get::<i32, _>(6)?.unwrap_or(0),
            });
        }

        if columns.is_empty() {
            return Err(MigrateError::TableNotFound(table.to_string()));
        }
        validate_all(columns.iter().map(|c| &c.name), "column name")?;
        Ok(columns)
    }

    /// Describe `table`: columns in declared order, their type descriptors
    /// and the current row count.
    ///
    /// Fails with `TableNotFound` when the catalog has no columns for it.
    pub async fn get_table_info(&self, table: &str) -> Result<TableInfo> {
        let columns = self.load_columns(table).await?;

        let count_sql = format!(
            "SELECT COUNT_BIG(*) FROM {} WITH (NOLOCK)",
            qualify_mssql(&self.schema, table)?
        );
        let row_count = {
            let mut client = self.client().await?;
            connection::query_scalar_i64(&mut client, &count_sql).await?
        };

        let info = TableInfo::from_columns(table, columns, row_count);
        debug!(
            "{}: {} columns, {} rows",
            table,
            info.columns.len(),
            info.row_count
        );
        Ok(info)
    }

    /// Read every row of `table` in declared column order.
    ///
    /// Rows are accumulated in memory; `batch_size` only controls how often
    /// progress is logged. Values of GUID columns come back as uppercase
    /// hyphenated text.
    pub async fn export_table_data(
        &self,
        table: &str,
        batch_size: usize,
    ) -> Result<(Vec<String>, Vec<Row>)> {
        let mut columns = self.load_columns(table).await?;
        columns.sort_by_key(|c| c.ordinal_pos);

        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let decode_types: Vec<String> = columns.iter().map(|c| decode_type(&c.data_type)).collect();
        let guid_indices: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| is_guid_type(&c.data_type))
            .map(|(i, _)| i)
            .collect();

        let sql = build_export_query(&self.schema, table, &columns)?;
        let progress_every = batch_size.max(1);

        let mut rows: Vec<Row> = Vec::new();
        {
            let mut client = self.client().await?;
            let mut stream = client.query(sql.as_str(), &[]).await?.into_row_stream();

            while let Some(tds_row) = stream.try_next().await? {
                let mut row = Vec::with_capacity(decode_types.len());
                for (idx, data_type) in decode_types.iter().enumerate() {
                    row.push(convert_row_value(&tds_row, idx, data_type)?);
                }
                rows.push(row);

                if rows.len() % progress_every == 0 {
                    debug!("{}: read {} rows", table, rows.len());
                }
            }
        }

        canonicalize_guid_columns(&mut rows, &guid_indices);
        info!("{}: exported {} rows", table, rows.len());
        Ok((names, rows))
    }

    /// Flag text columns whose sampled values mostly look like JSON.
    ///
    /// Samples up to `sample_size` rows in which at least one text column is
    /// non-null. A query failure is logged and yields no columns.
    pub async fn identify_json_columns(
        &self,
        table: &str,
        sample_size: usize,
    ) -> Result<HashSet<String>> {
        let columns = self.load_columns(table).await?;
        let text_columns: Vec<String> = columns
            .iter()
            .filter(|c| is_text_type(&c.data_type))
            .map(|c| c.name.clone())
            .collect();
        if text_columns.is_empty() {
            return Ok(HashSet::new());
        }

        let sql = build_sample_query(&self.schema, table, &text_columns, sample_size)?;
        match self.sample_text(&sql, text_columns.len()).await {
            Ok(samples) => {
                let found = classify_json_columns(&text_columns, &samples, JSON_THRESHOLD);
                if !found.is_empty() {
                    let mut names: Vec<&String> = found.iter().collect();
                    names.sort();
                    info!(
                        "{}: JSON-like columns widened to text: {}",
                        table,
                        names.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                    );
                }
                Ok(found)
            }
            Err(e) => {
                warn!("{}: JSON column detection failed, assuming none: {}", table, e);
                Ok(HashSet::new())
            }
        }
    }

    async fn sample_text(&self, sql: &str, width: usize) -> Result<Vec<Vec<Option<String>>>> {
        let mut client = self.client().await?;
        let rows = client.simple_query(sql).await?.into_first_result().await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                let value: Option<&str> = row.try_get(idx)?;
                values.push(value.map(str::to_string));
            }
            samples.push(values);
        }
        Ok(samples)
    }
}

fn is_system_table(name: &str) -> bool {
    SYSTEM_TABLES.iter().any(|t| t.eq_ignore_ascii_case(name))
}

/// Whether a catalog type holds character data.
fn is_text_type(data_type: &str) -> bool {
    let upper = data_type.to_ascii_uppercase();
    upper.contains("CHAR") || upper.contains("TEXT")
}

/// Type the exported column is decoded as after any server-side cast.
fn decode_type(data_type: &str) -> String {
    let lower = data_type.to_ascii_lowercase();
    if TEXT_CAST_TYPES.contains(&lower.as_str()) {
        "nvarchar".to_string()
    } else if MONEY_TYPES.contains(&lower.as_str()) {
        "decimal".to_string()
    } else {
        lower
    }
}

fn build_export_query(schema: &str, table: &str, columns: &[SourceColumn]) -> Result<String> {
    let mut select = Vec::with_capacity(columns.len());
    for column in columns {
        let quoted = quote_mssql(&column.name)?;
        let lower = column.data_type.to_ascii_lowercase();
        let expr = if TEXT_CAST_TYPES.contains(&lower.as_str()) {
            format!("CAST({} AS NVARCHAR(MAX)) AS {}", quoted, quoted)
        } else if MONEY_TYPES.contains(&lower.as_str()) {
            format!("CAST({} AS DECIMAL(19,4)) AS {}", quoted, quoted)
        } else {
            quoted
        };
        select.push(expr);
    }

    Ok(format!(
        "SELECT {} FROM {} WITH (NOLOCK)",
        select.join(", "),
        qualify_mssql(schema, table)?
    ))
}

fn build_sample_query(
    schema: &str,
    table: &str,
    text_columns: &[String],
    sample_size: usize,
) -> Result<String> {
    let quoted = text_columns
        .iter()
        .map(|c| quote_mssql(c))
        .collect::<Result<Vec<_>>>()?;
    let any_not_null = quoted
        .iter()
        .map(|c| format!("{} IS NOT NULL", c))
        .collect::<Vec<_>>()
        .join(" OR ");

    Ok(format!(
        "SELECT TOP ({}) {} FROM {} WITH (NOLOCK) WHERE {}",
        sample_size.max(1),
        quoted.join(", "),
        qualify_mssql(schema, table)?,
        any_not_null
    ))
}

/// Decode one column of a TDS row by its (post-cast) catalog type.
fn convert_row_value(row: &TdsRow, idx: usize, data_type: &str) -> Result<SqlValue<'static>> {
    let value = match data_type {
        "bit" => row
            .try_get::<bool, _>(idx)?
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        "tinyint" => row
            .try_get::<u8, _>(idx)?
            .map(|v| SqlValue::I16(i16::from(v)))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "smallint" => row
            .try_get::<i16, _>(idx)?
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "int" => row
            .try_get::<i32, _>(idx)?
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        "bigint" => row
            .try_get::<i64, _>(idx)?
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        "real" => row
            .try_get::<f32, _>(idx)?
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        "float" => row
            .try_get::<f64, _>(idx)?
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        "uniqueidentifier" => row
            .try_get::<Uuid, _>(idx)?
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        "datetime" | "datetime2" | "smalldatetime" => row
            .try_get::<NaiveDateTime, _>(idx)?
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        "datetimeoffset" => row
            .try_get::<DateTime<FixedOffset>, _>(idx)?
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        "date" => row
            .try_get::<NaiveDate, _>(idx)?
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        "time" => row
            .try_get::<NaiveTime, _>(idx)?
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => row
            .try_get::<&[u8], _>(idx)?
            .map(|v| SqlValue::Bytes(Cow::Owned(v.to_vec())))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        "decimal" | "numeric" => row
            .try_get::<rust_decimal::Decimal, _>(idx)?
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        _ => row
            .try_get::<&str, _>(idx)?
            .map(|s| SqlValue::Text(Cow::Owned(s.to_string())))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
    };
    Ok(value)
}

/// Rewrite every value in the GUID columns as uppercase hyphenated text.
pub fn canonicalize_guid_columns(rows: &mut [Row], guid_indices: &[usize]) {
    if guid_indices.is_empty() {
        return;
    }
    for row in rows.iter_mut() {
        for &idx in guid_indices {
            let Some(slot) = row.get_mut(idx) else {
                continue;
            };
            let upper = match slot {
                SqlValue::Uuid(u) => u.hyphenated().to_string().to_uppercase(),
                SqlValue::Text(s) => s.to_uppercase(),
                _ => continue,
            };
            *slot = SqlValue::Text(Cow::Owned(upper));
        }
    }
}

/// Whether the trimmed value is wrapped in matching `{}` or `[]`.
pub fn looks_like_json(value: &str) -> bool {
    let trimmed = value.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

/// Columns whose share of JSON-looking non-null samples exceeds `threshold`.
///
/// Each sample row lines up with `columns`. A column with no non-null
/// samples is never flagged.
pub fn classify_json_columns(
    columns: &[String],
    samples: &[Vec<Option<String>>],
    threshold: f64,
) -> HashSet<String> {
    let mut flagged = HashSet::new();

    for (idx, column) in columns.iter().enumerate() {
        let mut non_null = 0usize;
        let mut json_like = 0usize;
        for sample in samples {
            if let Some(Some(value)) = sample.get(idx) {
                non_null += 1;
                if looks_like_json(value) {
                    json_like += 1;
                }
            }
        }
        if non_null > 0 && (json_like as f64 / non_null as f64) > threshold {
            flagged.insert(column.clone());
        }
    }

    flagged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, data_type: &str, ordinal: i32) -> SourceColumn {
        SourceColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            max_length: None,
            precision: None,
            scale: None,
            is_nullable: true,
            ordinal_pos: ordinal,
        }
    }

    fn sample(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    #[test]
    fn test_looks_like_json() {
        assert!(looks_like_json(r#"{"a": 1}"#));
        assert!(looks_like_json("  [1, 2, 3]\n"));
        assert!(!looks_like_json("{ unclosed"));
        assert!(!looks_like_json("[mismatched}"));
        assert!(!looks_like_json("plain text"));
        assert!(!looks_like_json(""));
    }

    #[test]
    fn test_json_threshold_is_strict() {
        let columns = vec!["Data".to_string()];

        // exactly half
        let half = vec![
            sample(&[Some("{}")]),
            sample(&[Some("x")]),
            sample(&[Some("[1]")]),
            sample(&[Some("y")]),
        ];
        assert!(classify_json_columns(&columns, &half, JSON_THRESHOLD).is_empty());

        let most = vec![
            sample(&[Some("{}")]),
            sample(&[Some("[1]")]),
            sample(&[Some("y")]),
        ];
        assert!(classify_json_columns(&columns, &most, JSON_THRESHOLD).contains("Data"));
    }

    #[test]
    fn test_json_nulls_are_ignored() {
        let columns = vec!["A".to_string(), "B".to_string()];
        let samples = vec![
            sample(&[Some(r#"{"k":1}"#), None]),
            sample(&[None, None]),
            sample(&[None, Some("text")]),
        ];
        let found = classify_json_columns(&columns, &samples, JSON_THRESHOLD);
        assert!(found.contains("A"));
        assert!(!found.contains("B"));

        let all_null = vec![sample(&[None, None])];
        assert!(classify_json_columns(&columns, &all_null, JSON_THRESHOLD).is_empty());
    }

    #[test]
    fn test_canonicalize_guid_columns() {
        let uuid = Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap();
        let mut rows: Vec<Row> = vec![
            vec![SqlValue::I32(1), SqlValue::Uuid(uuid)],
            vec![
                SqlValue::I32(2),
                SqlValue::Text(Cow::Borrowed("abcdef00-0000-0000-0000-000000000000")),
            ],
            vec![SqlValue::I32(3), SqlValue::Null(SqlNullType::Uuid)],
        ];
        canonicalize_guid_columns(&mut rows, &[1]);

        assert_eq!(
            rows[0][1].as_str(),
            Some("6F9619FF-8B86-D011-B42D-00C04FC964FF")
        );
        assert_eq!(
            rows[1][1].as_str(),
            Some("ABCDEF00-0000-0000-0000-000000000000")
        );
        assert!(rows[2][1].is_null());
        assert_eq!(rows[0][0], SqlValue::I32(1));
    }

    #[test]
    fn test_export_query_casts_undecodable_types() {
        let columns = vec![
            col("Id", "int", 1),
            col("Doc", "xml", 2),
            col("Price", "money", 3),
            col("Shape", "geography", 4),
        ];
        let sql = build_export_query("dbo", "Orders", &columns).unwrap();
        assert_eq!(
            sql,
            "SELECT [Id], CAST([Doc] AS NVARCHAR(MAX)) AS [Doc], \
             CAST([Price] AS DECIMAL(19,4)) AS [Price], \
             CAST([Shape] AS NVARCHAR(MAX)) AS [Shape] FROM [dbo].[Orders] WITH (NOLOCK)"
        );
        assert_eq!(decode_type("XML"), "nvarchar");
        assert_eq!(decode_type("smallmoney"), "decimal");
        assert_eq!(decode_type("DateTime2"), "datetime2");
    }

    #[test]
    fn test_sample_query_requires_any_non_null() {
        let sql = build_sample_query(
            "dbo",
            "Cipher",
            &["Data".to_string(), "Attachments".to_string()],
            100,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT TOP (100) [Data], [Attachments] FROM [dbo].[Cipher] WITH (NOLOCK) \
             WHERE [Data] IS NOT NULL OR [Attachments] IS NOT NULL"
        );
    }

    #[test]
    fn test_text_types_and_system_tables() {
        assert!(is_text_type("nvarchar"));
        assert!(is_text_type("NTEXT"));
        assert!(is_text_type("char"));
        assert!(!is_text_type("uniqueidentifier"));
        assert!(!is_text_type("xml"));

        assert!(is_system_table("sysdiagrams"));
        assert!(is_system_table("__efmigrationshistory"));
        assert!(!is_system_table("User"));
    }

    #[test]
    fn test_reader_starts_disconnected() {
        let reader = MssqlReader::new(DatabaseConfig {
            host: "localhost".to_string(),
            database: "Vault".to_string(),
            ..Default::default()
        });
        assert!(!reader.is_connected());
        assert_eq!(reader.schema(), "dbo");
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let reader = MssqlReader::new(DatabaseConfig::default());
        let err = reader.discover_tables(true).await.unwrap_err();
        assert!(matches!(err, MigrateError::NotConnected(_)));
    }
}
