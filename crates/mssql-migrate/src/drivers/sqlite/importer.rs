//! SQLite target importer.
//!
//! The database is a single file opened through one `SqliteConnection`
//! in WAL mode. There is no native bulk path; every batch is a
//! multi-row `INSERT` inside its own transaction.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection, Row as _, Sqlite};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::core::batch::{import_in_batches, BatchSink, ColumnProjection};
use crate::core::identifier::{quote_pg as quote_sqlite, validate_all, validate_or_reject};
use crate::core::schema::{column_definitions, validate_table_names, TableInfo};
use crate::core::traits::{Importer, TypeMapper};
use crate::core::value::{Row, SqlValue};
use crate::dialect::coerce::CoercionRules;
use crate::dialect::MssqlToSqliteMapper;
use crate::drivers::TargetKind;
use crate::error::{MigrateError, Result};

/// Host parameter limit of SQLite 3.32 and later.
const MAX_VARIABLES: usize = 32766;

const IN_MEMORY: &str = ":memory:";

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite importer.
pub struct SqliteImporter {
    config: DatabaseConfig,
    conn: Option<SqliteConnection>,
}

impl SqliteImporter {
    /// Create a disconnected importer for the file named by `config.database`.
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config, conn: None }
    }

    fn path(&self) -> &str {
        self.config.database.trim()
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions> {
        let path = self.path();
        if path.is_empty() {
            return Err(MigrateError::Config(
                "target.database must name the SQLite file".to_string(),
            ));
        }

        let options = if path == IN_MEMORY {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };
        Ok(options
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true))
    }

    async fn open_conn(&self) -> Result<SqliteConnection> {
        let path = self.path();
        if path != IN_MEMORY {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        self.connect_options()?
            .connect()
            .await
            .map_err(|e| MigrateError::connection("sqlite", format!("{}: {}", path, e)))
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn.as_mut().ok_or(MigrateError::NotConnected("sqlite"))
    }

    /// Actual spelling of `table`; SQLite names compare case-insensitively.
    async fn resolve_table(&mut self, table: &str) -> Result<Option<String>> {
        validate_or_reject(table, "table name")?;
        let conn = self.conn()?;

        let row = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE LIMIT 1",
        )
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(|r| r.try_get::<String, _>("name"))
            .transpose()
            .map_err(Into::into)
    }

    async fn require_table(&mut self, table: &str) -> Result<String> {
        self.resolve_table(table)
            .await?
            .ok_or_else(|| MigrateError::TableNotFound(table.to_string()))
    }

    /// `(name, declared type)` of every column, in declared order.
    async fn target_columns(&mut self, actual_table: &str) -> Result<Vec<(String, String)>> {
        let sql = format!("PRAGMA table_info({})", quote_sqlite(actual_table)?);
        let rows = sqlx::query(&sql).fetch_all(&mut *self.conn()?).await?;

        rows.iter()
            .map(|r| {
                let name: String = r.try_get("name")?;
                let data_type: String = r.try_get("type")?;
                Ok((name, data_type.to_ascii_lowercase()))
            })
            .collect()
    }
}

#[async_trait]
impl Importer for SqliteImporter {
    fn kind(&self) -> TargetKind {
        TargetKind::Sqlite
    }

    async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = self.open_conn().await?;
        info!("Opened SQLite target: {}", self.path());
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        if self.path() != IN_MEMORY {
            if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&mut conn)
                .await
            {
                warn!("WAL checkpoint failed: {}", e);
            }
        }
        conn.close().await?;
        debug!("Closed SQLite target");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn test_connection(&mut self) -> Result<()> {
        let mut conn = self.open_conn().await?;
        sqlx::query("SELECT 1").execute(&mut conn).await?;
        conn.close().await?;
        info!("SQLite target connection OK");
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
        let sql = create_table_sql(table, special_columns, &MssqlToSqliteMapper)?;
        sqlx::query(&sql).execute(&mut *self.conn()?).await?;
        info!("Created table {} (if missing)", table.name);
        Ok(())
    }

    async fn get_columns(&mut self, table: &str) -> Result<Vec<String>> {
        let actual = self.require_table(table).await?;
        let columns = self.target_columns(&actual).await?;
        Ok(columns.into_iter().map(|(name, _)| name).collect())
    }

    async fn import_rows(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
        batch_size: usize,
    ) -> Result<u64> {
        validate_all(columns, "column name")?;
        let actual = self.require_table(table).await?;
        let target = self.target_columns(&actual).await?;

        let target_names: Vec<String> = target.iter().map(|(n, _)| n.clone()).collect();
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

        let types: Vec<String> = projection
            .columns
            .iter()
            .map(|name| {
                target
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, t)| t.clone())
                    .unwrap_or_default()
            })
            .collect();
        let prepared = projection.prepare(rows, &types, &CoercionRules::SQLITE);

        let mut sink = SqliteInsertSink {
            table: quote_sqlite(&actual)?,
            columns: projection
                .columns
                .iter()
                .map(|c| quote_sqlite(c))
                .collect::<Result<Vec<_>>>()?,
            conn: self.conn()?,
        };
        let written = import_in_batches(&mut sink, table, &prepared, batch_size).await?;
        info!("{}: imported {} rows", table, written);
        Ok(written)
    }

    async fn drop_table(&mut self, table: &str) -> Result<()> {
        validate_or_reject(table, "table name")?;
        let sql = format!("DROP TABLE IF EXISTS {}", quote_sqlite(table)?);
        sqlx::query(&sql).execute(&mut *self.conn()?).await?;
        info!("Dropped table {} (if it existed)", table);
        Ok(())
    }

    async fn row_count(&mut self, table: &str) -> Result<i64> {
        let actual = self.require_table(table).await?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_sqlite(&actual)?);
        let row = sqlx::query(&sql).fetch_one(&mut *self.conn()?).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    async fn disable_foreign_keys(&mut self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *self.conn()?)
            .await?;
        info!("Foreign key enforcement disabled");
        Ok(())
    }

    async fn enable_foreign_keys(&mut self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *self.conn()?)
            .await?;
        info!("Foreign key enforcement re-enabled");
        Ok(())
    }
}

fn create_table_sql(
    table: &TableInfo,
    special_columns: &HashSet<String>,
    mapper: &dyn TypeMapper,
) -> Result<String> {
    validate_table_names(table)?;
    let definitions = column_definitions(table, special_columns, mapper, quote_sqlite)?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_sqlite(&table.name)?,
        definitions.join(", ")
    ))
}

fn rows_per_insert(cols_per_row: usize) -> usize {
    (MAX_VARIABLES / cols_per_row.max(1)).max(1)
}

fn insert_sql(table: &str, quoted_columns: &[String], rows: usize) -> String {
    let row = format!("({})", vec!["?"; quoted_columns.len()].join(", "));
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        quoted_columns.join(", "),
        vec![row; rows].join(", ")
    )
}

/// Bind one value. SQLite is dynamically typed, so temporal values and
/// GUIDs are stored in their text form.
fn bind_value<'q>(query: SqliteQuery<'q>, value: &SqlValue<'_>) -> SqliteQuery<'q> {
    match value {
        SqlValue::Null(_) => query.bind(Option::<String>::None),
        SqlValue::Bool(b) => query.bind(i64::from(*b)),
        SqlValue::I16(i) => query.bind(i64::from(*i)),
        SqlValue::I32(i) => query.bind(i64::from(*i)),
        SqlValue::I64(i) => query.bind(*i),
        SqlValue::F32(f) => query.bind(f64::from(*f)),
        SqlValue::F64(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.to_string()),
        SqlValue::Bytes(b) => query.bind(b.to_vec()),
        other => query.bind(other.render_text()),
    }
}

struct SqliteInsertSink<'a> {
    conn: &'a mut SqliteConnection,
    table: String,
    columns: Vec<String>,
}

#[async_trait]
impl BatchSink for SqliteInsertSink<'_> {
    async fn write_batch(&mut self, _offset: usize, rows: &[Row]) -> Result<u64> {
        let mut tx = self.conn.begin().await?;
        let mut inserted = 0u64;

        for chunk in rows.chunks(rows_per_insert(self.columns.len())) {
            let sql = insert_sql(&self.table, &self.columns, chunk.len());
            let mut query = sqlx::query(&sql);
            for value in chunk.iter().flatten() {
                query = bind_value(query, value);
            }
            if let Err(e) = query.execute(&mut *tx).await {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("{}: rollback failed: {}", self.table, rollback_err);
                }
                return Err(e.into());
            }
            inserted += chunk.len() as u64;
        }

        tx.commit().await?;
        Ok(inserted)
    }
}
