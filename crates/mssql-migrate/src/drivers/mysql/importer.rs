//! MySQL/MariaDB target importer.
//!
//! Uses one dedicated `mysql_async::Conn`; `FOREIGN_KEY_CHECKS`,
//! `UNIQUE_CHECKS` and `sql_mode` are session variables and stay set on it
//! between calls.

use std::collections::HashSet;

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, TxOpts, Value};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::core::batch::{import_in_batches, BatchSink, ColumnProjection};
use crate::core::identifier::{quote_mysql, validate_all, validate_or_reject};
use crate::core::schema::{column_definitions, validate_table_names, TableInfo};
use crate::core::traits::{Importer, TypeMapper};
use crate::core::value::{Row, SqlValue};
use crate::dialect::coerce::CoercionRules;
use crate::dialect::MssqlToMysqlMapper;
use crate::drivers::common::{SslMode, TlsBuilder};
use crate::drivers::TargetKind;
use crate::error::{MigrateError, Result};

/// Default MySQL port.
pub const MYSQL_DEFAULT_PORT: u16 = 3306;

/// MySQL max placeholders per prepared statement.
const MAX_PLACEHOLDERS: usize = 65535;

/// Rows per transaction on the bulk path.
const BULK_CHUNK_ROWS: usize = 10_000;

const TABLE_OPTIONS: &str = "ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci";

const NO_AUTO_VALUE_ON_ZERO: &str = "NO_AUTO_VALUE_ON_ZERO";

/// Column metadata of an existing target table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TargetColumn {
    name: String,
    /// Full column type, e.g. `"datetime(6)"`.
    column_type: String,
    auto_increment: bool,
}

/// MySQL/MariaDB importer.
pub struct MysqlImporter {
    config: DatabaseConfig,
    /// Explicit schema; `None` means the connection's database.
    schema: Option<String>,
    conn: Option<Conn>,
}

impl MysqlImporter {
    /// Create a disconnected importer.
    pub fn new(config: DatabaseConfig) -> Self {
        let schema = config
            .schema
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Self {
            config,
            schema,
            conn: None,
        }
    }

    fn describe(&self) -> String {
        format!(
            "{}:{}/{}",
            self.config.host,
            self.config.port_or(MYSQL_DEFAULT_PORT),
            self.config.database
        )
    }

    fn opts(&self) -> Result<Opts> {
        let ssl_mode: SslMode = self.config.ssl_mode.parse()?;
        let ssl_opts = TlsBuilder::new(ssl_mode).mysql_ssl_opts();
        if ssl_opts.is_none() {
            warn!("MySQL TLS is disabled. Credentials will be transmitted in plaintext.");
        }

        let builder = OptsBuilder::default()
            .ip_or_hostname(&self.config.host)
            .tcp_port(self.config.port_or(MYSQL_DEFAULT_PORT))
            .db_name(Some(&self.config.database))
            .user(Some(&self.config.user))
            .pass(Some(&self.config.password))
            // Use utf8mb4 for full Unicode support
            .init(vec!["SET NAMES utf8mb4"])
            .ssl_opts(ssl_opts);
        Ok(builder.into())
    }

    async fn open_conn(&self) -> Result<Conn> {
        Conn::new(self.opts()?)
            .await
            .map_err(|e| MigrateError::connection("mariadb", format!("{}: {}", self.describe(), e)))
    }

    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn.as_mut().ok_or(MigrateError::NotConnected("mariadb"))
    }

    fn qualify(&self, table: &str) -> Result<String> {
        match &self.schema {
            Some(schema) => Ok(format!("{}.{}", quote_mysql(schema)?, quote_mysql(table)?)),
            None => quote_mysql(table),
        }
    }

    /// Actual spelling of `table`, matched case-insensitively.
    async fn resolve_table(&mut self, table: &str) -> Result<Option<String>> {
        validate_or_reject(table, "table name")?;
        let schema = self.schema.clone();
        let conn = self.conn()?;

        let name: Option<String> = conn
            .exec_first(
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) \
                   AND LOWER(TABLE_NAME) = LOWER(?) AND TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY (TABLE_NAME = ?) DESC LIMIT 1",
                (schema, table, table),
            )
            .await?;
        Ok(name)
    }

    async fn require_table(&mut self, table: &str) -> Result<String> {
        self.resolve_table(table)
            .await?
            .ok_or_else(|| MigrateError::TableNotFound(table.to_string()))
    }

    async fn target_columns(&mut self, actual_table: &str) -> Result<Vec<TargetColumn>> {
        let schema = self.schema.clone();
        let conn = self.conn()?;

        let rows: Vec<(String, String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE, EXTRA FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (schema, actual_table),
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|(name, column_type, extra)| TargetColumn {
                name,
                column_type: column_type.to_ascii_lowercase(),
                auto_increment: extra.to_ascii_lowercase().contains("auto_increment"),
            })
            .collect())
    }

    async fn import(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
        batch_size: usize,
    ) -> Result<u64> {
        validate_all(columns, "column name")?;
        let actual = self.require_table(table).await?;
        let target = self.target_columns(&actual).await?;

        let target_names: Vec<String> = target.iter().map(|c| c.name.clone()).collect();
        let projection = ColumnProjection::resolve(columns, &target_names);
        projection.warn_skipped(table);
        if projection.is_empty() {
            return Err(MigrateError::Validation(format!(
                "{}: no source column matches a target column",
                table
            )));
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let projected: Vec<&TargetColumn> = projection
            .columns
            .iter()
            .filter_map(|name| target.iter().find(|c| &c.name == name))
            .collect();
        let types: Vec<String> = projected.iter().map(|c| c.column_type.clone()).collect();
        let auto_increment_supplied = projected.iter().any(|c| c.auto_increment);
        let prepared = projection.prepare(rows, &types, &CoercionRules::MYSQL);

        let qualified = self.qualify(&actual)?;
        let quoted_columns = projection
            .columns
            .iter()
            .map(|c| quote_mysql(c))
            .collect::<Result<Vec<_>>>()?;
        let conn = self.conn()?;

        let saved_mode = if auto_increment_supplied {
            Some(allow_zero_auto_increment(conn).await?)
        } else {
            None
        };

        let mut sink = MysqlInsertSink {
            conn: &mut *conn,
            table: qualified,
            columns: quoted_columns,
        };
        let result = import_in_batches(&mut sink, table, &prepared, batch_size).await;

        if let Some(mode) = saved_mode {
            if let Err(e) = conn.exec_drop("SET SESSION sql_mode = ?", (mode,)).await {
                warn!("{}: failed to restore sql_mode: {}", table, e);
            }
        }

        let written = result?;
        info!("{}: imported {} rows", table, written);
        Ok(written)
    }
}

/// Add `NO_AUTO_VALUE_ON_ZERO` to the session `sql_mode` so that explicit
/// zero values in auto-increment columns are kept. Returns the old mode.
async fn allow_zero_auto_increment(conn: &mut Conn) -> Result<String> {
    let current: Option<String> = conn.query_first("SELECT @@SESSION.sql_mode").await?;
    let current = current.unwrap_or_default();
    let updated = with_sql_mode_flag(&current, NO_AUTO_VALUE_ON_ZERO);
    if updated != current {
        conn.exec_drop("SET SESSION sql_mode = ?", (updated,)).await?;
        debug!("sql_mode now includes {}", NO_AUTO_VALUE_ON_ZERO);
    }
    Ok(current)
}

fn with_sql_mode_flag(mode: &str, flag: &str) -> String {
    if mode.split(',').any(|m| m.trim().eq_ignore_ascii_case(flag)) {
        mode.to_string()
    } else if mode.trim().is_empty() {
        flag.to_string()
    } else {
        format!("{},{}", mode, flag)
    }
}

#[async_trait]
impl Importer for MysqlImporter {
    fn kind(&self) -> TargetKind {
        TargetKind::MySql
    }

    async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        if let Some(schema) = &self.schema {
            validate_or_reject(schema, "schema name")?;
        }

        let conn = self.open_conn().await?;
        info!("Connected to MySQL target: {}", self.describe());
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.disconnect().await?;
            debug!("Disconnected from MySQL target");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn test_connection(&mut self) -> Result<()> {
        let mut conn = self.open_conn().await?;
        conn.query_drop("SELECT 1").await?;
        conn.disconnect().await?;
        info!("MySQL target connection OK");
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self.resolve_table(table).await?.is_some())
    }

    async fn create_table_from_schema(
        &mut self,
        table: &TableInfo,
        special_columns: &HashSet<String>,
    ) -> Result<()> {
        let sql = create_table_sql(
            &self.qualify(&table.name)?,
            table,
            special_columns,
            &MssqlToMysqlMapper,
        )?;
        if let Some(actual) = self.resolve_table(&table.name).await? {
            debug!("{}: table already exists as {}", table.name, actual);
            return Ok(());
        }

        self.conn()?.query_drop(sql).await?;
        info!("Created table {}", table.name);
        Ok(())
    }

    async fn get_columns(&mut self, table: &str) -> Result<Vec<String>> {
        let actual = self.require_table(table).await?;
        let columns = self.target_columns(&actual).await?;
        Ok(columns.into_iter().map(|c| c.name).collect())
    }

    async fn import_rows(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
        batch_size: usize,
    ) -> Result<u64> {
        self.import(table, columns, rows, batch_size).await
    }

    fn supports_bulk_import(&self) -> bool {
        true
    }

    /// Same statements as `import_rows`, in 10,000-row transactions.
    async fn import_rows_bulk(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
        batch_size: usize,
    ) -> Result<u64> {
        self.import(table, columns, rows, batch_size.max(BULK_CHUNK_ROWS))
            .await
    }

    async fn drop_table(&mut self, table: &str) -> Result<()> {
        let actual = self
            .resolve_table(table)
            .await?
            .unwrap_or_else(|| table.to_string());
        let sql = format!("DROP TABLE IF EXISTS {}", self.qualify(&actual)?);
        self.conn()?.query_drop(sql).await?;
        info!("Dropped table {} (if it existed)", actual);
        Ok(())
    }

    async fn row_count(&mut self, table: &str) -> Result<i64> {
        let actual = self.require_table(table).await?;
        let sql = format!("SELECT COUNT(*) FROM {}", self.qualify(&actual)?);
        let count: Option<i64> = self.conn()?.query_first(sql).await?;
        Ok(count.unwrap_or(0))
    }

    async fn disable_foreign_keys(&mut self) -> Result<()> {
        self.conn()?
            .query_drop("SET FOREIGN_KEY_CHECKS=0; SET UNIQUE_CHECKS=0")
            .await?;
        info!("Foreign key and unique checks disabled for this session");
        Ok(())
    }

    async fn enable_foreign_keys(&mut self) -> Result<()> {
        self.conn()?
            .query_drop("SET FOREIGN_KEY_CHECKS=1; SET UNIQUE_CHECKS=1")
            .await?;
        info!("Foreign key and unique checks re-enabled");
        Ok(())
    }
}

fn create_table_sql(
    qualified: &str,
    table: &TableInfo,
    special_columns: &HashSet<String>,
    mapper: &dyn TypeMapper,
) -> Result<String> {
    validate_table_names(table)?;
    let definitions = column_definitions(table, special_columns, mapper, quote_mysql)?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) {}",
        qualified,
        definitions.join(", "),
        TABLE_OPTIONS
    ))
}

fn rows_per_insert(cols_per_row: usize) -> usize {
    (MAX_PLACEHOLDERS / cols_per_row.max(1)).max(1)
}

fn insert_sql(qualified: &str, quoted_columns: &[String], rows: usize) -> String {
    let placeholders_per_row = format!("({})", vec!["?"; quoted_columns.len()].join(", "));
    let all_placeholders = vec![placeholders_per_row; rows];
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified,
        quoted_columns.join(", "),
        all_placeholders.join(", ")
    )
}

/// Batched multi-row `INSERT`, one transaction per batch.
struct MysqlInsertSink<'a> {
    conn: &'a mut Conn,
    table: String,
    columns: Vec<String>,
}

async fn insert_chunks<Q: Queryable>(
    conn: &mut Q,
    table: &str,
    columns: &[String],
    rows: &[Row],
) -> Result<u64> {
    let mut inserted = 0u64;
    for chunk in rows.chunks(rows_per_insert(columns.len())) {
        let sql = insert_sql(table, columns, chunk.len());
        let params: Vec<Value> = chunk
            .iter()
            .flat_map(|row| row.iter().map(to_mysql_value))
            .collect();
        conn.exec_drop(sql, params).await?;
        inserted += chunk.len() as u64;
    }
    Ok(inserted)
}

#[async_trait]
impl BatchSink for MysqlInsertSink<'_> {
    async fn write_batch(&mut self, _offset: usize, rows: &[Row]) -> Result<u64> {
        let mut tx = self.conn.start_transaction(TxOpts::default()).await?;
        match insert_chunks(&mut tx, &self.table, &self.columns, rows).await {
            Ok(n) => {
                tx.commit().await?;
                Ok(n)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("{}: rollback failed: {}", self.table, rollback_err);
                }
                Err(e)
            }
        }
    }
}

/// Temporal values are sent as text, which MySQL parses for every
/// date/time column type.
fn to_mysql_value(value: &SqlValue<'_>) -> Value {
    match value {
        SqlValue::Null(_) => Value::NULL,
        SqlValue::Bool(b) => Value::from(*b),
        SqlValue::I16(i) => Value::from(*i),
        SqlValue::I32(i) => Value::from(*i),
        SqlValue::I64(i) => Value::from(*i),
        SqlValue::F32(f) => Value::from(*f),
        SqlValue::F64(f) => Value::from(*f),
        SqlValue::Text(s) => Value::Bytes(s.as_bytes().to_vec()),
        SqlValue::Bytes(b) => Value::Bytes(b.to_vec()),
        SqlValue::DateTimeOffset(dto) => {
            Value::from(dto.naive_local().format("%Y-%m-%d %H:%M:%S%.f").to_string())
        }
        other => other.render_text().map(Value::from).unwrap_or(Value::NULL),
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use chrono::NaiveDate;
    use uuid::Uuid;

    use super::*;
    use crate::core::schema::SourceColumn;

    #[test]
    fn test_create_table_sql() {
        let info = TableInfo::from_columns(
            "Device",
            vec![
                SourceColumn {
                    name: "Id".to_string(),
                    data_type: "uniqueidentifier".to_string(),
                    max_length: None,
                    precision: None,
                    scale: None,
                    is_nullable: false,
                    ordinal_pos: 1,
                },
                SourceColumn {
                    name: "PushToken".to_string(),
                    data_type: "nvarchar".to_string(),
                    max_length: Some(255),
                    precision: None,
                    scale: None,
                    is_nullable: true,
                    ordinal_pos: 2,
                },
            ],
            0,
        );
        let special = HashSet::from(["pushtoken".to_string()]);
        let sql = create_table_sql("`Device`", &info, &special, &MssqlToMysqlMapper).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS `Device` (`Id` CHAR(36) NOT NULL, `PushToken` LONGTEXT NULL) \
             ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci"
        );
    }

    #[test]
    fn test_insert_sql() {
        let cols = vec!["`a`".to_string(), "`b`".to_string()];
        assert_eq!(
            insert_sql("`t`", &cols, 2),
            "INSERT INTO `t` (`a`, `b`) VALUES (?, ?), (?, ?)"
        );
        assert_eq!(rows_per_insert(3), 21845);
    }

    #[test]
    fn test_sql_mode_flag() {
        assert_eq!(
            with_sql_mode_flag("STRICT_TRANS_TABLES", NO_AUTO_VALUE_ON_ZERO),
            "STRICT_TRANS_TABLES,NO_AUTO_VALUE_ON_ZERO"
        );
        assert_eq!(with_sql_mode_flag("", NO_AUTO_VALUE_ON_ZERO), "NO_AUTO_VALUE_ON_ZERO");
        assert_eq!(
            with_sql_mode_flag("NO_AUTO_VALUE_ON_ZERO", NO_AUTO_VALUE_ON_ZERO),
            "NO_AUTO_VALUE_ON_ZERO"
        );
    }

    #[test]
    fn test_values_sent_as_text_for_temporal_and_uuid() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(12, 30, 0, 250_000)
            .unwrap();
        assert_eq!(
            to_mysql_value(&SqlValue::DateTime(dt)),
            Value::from("2024-03-01 12:30:00.250")
        );

        let u = Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap();
        assert_eq!(
            to_mysql_value(&SqlValue::Uuid(u)),
            Value::from("6F9619FF-8B86-D011-B42D-00C04FC964FF")
        );
        assert_eq!(
            to_mysql_value(&SqlValue::Text(Cow::Borrowed("x"))),
            Value::from("x")
        );
        assert_eq!(
            to_mysql_value(&SqlValue::Null(crate::core::SqlNullType::I32)),
            Value::NULL
        );
    }

    #[test]
    fn test_explicit_schema_qualifies_names() {
        let importer = MysqlImporter::new(DatabaseConfig {
            database: "vault".to_string(),
            schema: Some("archive".to_string()),
            ..Default::default()
        });
        assert_eq!(importer.qualify("User").unwrap(), "`archive`.`User`");

        let plain = MysqlImporter::new(DatabaseConfig {
            database: "vault-prod".to_string(),
            ..Default::default()
        });
        assert_eq!(plain.qualify("User").unwrap(), "`User`");
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut importer = MysqlImporter::new(DatabaseConfig::default());
        let err = importer.row_count("User").await.unwrap_err();
        assert!(matches!(err, MigrateError::NotConnected("mariadb")));
    }
}
