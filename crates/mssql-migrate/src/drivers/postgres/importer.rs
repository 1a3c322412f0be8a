//! PostgreSQL target importer.
//!
//! The importer holds one pooled session for its whole lifetime so that
//! `session_replication_role` stays in force between calls. Table and column
//! names are resolved case-insensitively against the catalog, because the
//! source keeps SQL Server casing while hand-made targets are often lowercase.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::core::batch::{import_in_batches, BatchSink, ColumnProjection};
use crate::core::identifier::{qualify_pg, quote_pg, validate_all, validate_or_reject};
use crate::core::schema::{column_definitions, validate_table_names, TableInfo};
use crate::core::traits::{Importer, TypeMapper};
use crate::core::value::{Row, SqlValue};
use crate::dialect::coerce::CoercionRules;
use crate::dialect::MssqlToPostgresMapper;
use crate::drivers::common::{SslMode, TlsBuilder};
use crate::drivers::TargetKind;
use crate::error::{MigrateError, Result};

/// Default PostgreSQL port.
pub const PG_DEFAULT_PORT: u16 = 5432;

/// Default PostgreSQL schema.
pub const PG_DEFAULT_SCHEMA: &str = "public";

/// Bind parameter limit per statement.
const MAX_PARAMS: usize = 65535;

/// Connection timeout.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Rows buffered per COPY send.
const COPY_CHUNK_ROWS: usize = 10_000;

/// Column metadata of an existing target table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TargetColumn {
    name: String,
    /// `format_type` output, e.g. `"character varying(255)"`.
    data_type: String,
    /// `GENERATED ALWAYS AS IDENTITY`.
    identity_always: bool,
    is_identity: bool,
}

/// PostgreSQL importer.
pub struct PostgresImporter {
    config: DatabaseConfig,
    schema: String,
    pool: Option<Pool>,
    client: Option<Object>,
}

impl PostgresImporter {
    /// Create a disconnected importer.
    pub fn new(config: DatabaseConfig) -> Self {
        let schema = config.schema_or(PG_DEFAULT_SCHEMA).to_string();
        Self {
            config,
            schema,
            pool: None,
            client: None,
        }
    }

    fn describe(&self) -> String {
        format!(
            "{}:{}/{}",
            self.config.host,
            self.config.port_or(PG_DEFAULT_PORT),
            self.config.database
        )
    }

    fn build_pool(&self) -> Result<Pool> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&self.config.host);
        pg_config.port(self.config.port_or(PG_DEFAULT_PORT));
        pg_config.dbname(&self.config.database);
        pg_config.user(&self.config.user);
        pg_config.password(&self.config.password);

        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let ssl_mode: SslMode = self.config.ssl_mode.parse()?;
        let mgr = match TlsBuilder::new(ssl_mode).postgres_connector()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
        };

        Pool::builder(mgr)
            .max_size(1)
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))
    }

    async fn open_session(&self) -> Result<(Pool, Object)> {
        let pool = self.build_pool()?;
        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::connection("postgres", format!("{}: {}", self.describe(), e)))?;
        client.simple_query("SELECT 1").await?;
        Ok((pool, client))
    }

    fn client(&mut self) -> Result<&mut Object> {
        self.client
            .as_mut()
            .ok_or(MigrateError::NotConnected("postgres"))
    }

    /// Actual spelling of `table` in the configured schema.
    async fn resolve_table(&mut self, table: &str) -> Result<Option<String>> {
        validate_or_reject(table, "table name")?;
        let schema = self.schema.clone();
        let client = self.client()?;

        let row = client
            .query_opt(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = $1 AND lower(table_name) = lower($2) \
                   AND table_type = 'BASE TABLE' \
                 ORDER BY (table_name = $2) DESC \
                 LIMIT 1",
                &[&schema, &table],
            )
            .await?;
        Ok(row.map(|r| r.get::<_, String>(0)))
    }

    async fn require_table(&mut self, table: &str) -> Result<String> {
        self.resolve_table(table)
            .await?
            .ok_or_else(|| MigrateError::TableNotFound(table.to_string()))
    }

    async fn target_columns(&mut self, actual_table: &str) -> Result<Vec<TargetColumn>> {
        let schema = self.schema.clone();
        let client = self.client()?;

        let rows = client
            .query(
                "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), a.attidentity::text \
                 FROM pg_attribute a \
                 JOIN pg_class c ON a.attrelid = c.oid \
                 JOIN pg_namespace n ON c.relnamespace = n.oid \
                 WHERE n.nspname = $1 AND c.relname = $2 \
                   AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
                &[&schema, &actual_table],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let identity: String = row.get(2);
                TargetColumn {
                    name: row.get(0),
                    data_type: row.get(1),
                    identity_always: identity == "a",
                    is_identity: !identity.is_empty(),
                }
            })
            .collect())
    }

    async fn import(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
        batch_size: usize,
        use_copy: bool,
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
        let types: Vec<String> = projected.iter().map(|c| c.data_type.clone()).collect();
        let overriding = projected.iter().any(|c| c.identity_always);
        let identity_columns: Vec<String> = projected
            .iter()
            .filter(|c| c.is_identity)
            .map(|c| c.name.clone())
            .collect();
        let prepared = projection.prepare(rows, &types, &CoercionRules::POSTGRES);

        let qualified = qualify_pg(&self.schema, &actual)?;
        let quoted_columns = projection
            .columns
            .iter()
            .map(|c| quote_pg(c))
            .collect::<Result<Vec<_>>>()?;
        let client = self.client()?;

        let written = if use_copy {
            debug!("{}: using COPY", table);
            copy_rows(client, &qualified, &quoted_columns, &prepared)
                .await
                .map_err(|e| MigrateError::batch_failure(table, 0, prepared.len(), e))?
        } else {
            let mut sink = PgInsertSink {
                client: &mut *client,
                insert_prefix: insert_prefix(&qualified, &quoted_columns, overriding),
                types,
            };
            import_in_batches(&mut sink, table, &prepared, batch_size).await?
        };

        for column in &identity_columns {
            if let Err(e) = sync_identity(client, &qualified, column).await {
                warn!("{}: could not advance identity of {}: {}", table, column, e);
            }
        }

        info!("{}: imported {} rows", table, written);
        Ok(written)
    }
}

#[async_trait]
impl Importer for PostgresImporter {
    fn kind(&self) -> TargetKind {
        TargetKind::Postgres
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        validate_or_reject(&self.schema, "schema name")?;

        let (pool, client) = self.open_session().await?;
        info!("Connected to PostgreSQL target: {}", self.describe());
        self.pool = Some(pool);
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.client = None;
        if let Some(pool) = self.pool.take() {
            pool.close();
            debug!("Disconnected from PostgreSQL target");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn test_connection(&mut self) -> Result<()> {
        let (pool, client) = self.open_session().await?;
        drop(client);
        pool.close();
        info!("PostgreSQL target connection OK");
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
        let sql = create_table_sql(&self.schema, table, special_columns, &MssqlToPostgresMapper)?;
        if let Some(actual) = self.resolve_table(&table.name).await? {
            debug!("{}: table already exists as {}", table.name, actual);
            return Ok(());
        }

        self.client()?.batch_execute(&sql).await?;
        info!("Created table {}.{}", self.schema, table.name);
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
        self.import(table, columns, rows, batch_size, false).await
    }

    fn supports_bulk_import(&self) -> bool {
        true
    }

    async fn import_rows_bulk(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
        batch_size: usize,
    ) -> Result<u64> {
        self.import(table, columns, rows, batch_size, true).await
    }

    async fn drop_table(&mut self, table: &str) -> Result<()> {
        let actual = self
            .resolve_table(table)
            .await?
            .unwrap_or_else(|| table.to_string());
        let sql = format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            qualify_pg(&self.schema, &actual)?
        );
        self.client()?.batch_execute(&sql).await?;
        info!("Dropped table {}.{} (if it existed)", self.schema, actual);
        Ok(())
    }

    async fn row_count(&mut self, table: &str) -> Result<i64> {
        let actual = self.require_table(table).await?;
        let sql = format!("SELECT COUNT(*) FROM {}", qualify_pg(&self.schema, &actual)?);
        let row = self.client()?.query_one(sql.as_str(), &[]).await?;
        Ok(row.get(0))
    }

    async fn disable_foreign_keys(&mut self) -> Result<()> {
        self.client()?
            .batch_execute("SET session_replication_role = replica")
            .await?;
        info!("Foreign key enforcement suspended for this session");
        Ok(())
    }

    async fn enable_foreign_keys(&mut self) -> Result<()> {
        self.client()?
            .batch_execute("SET session_replication_role = DEFAULT")
            .await?;
        info!("Foreign key enforcement restored");
        Ok(())
    }
}

fn create_table_sql(
    schema: &str,
    table: &TableInfo,
    special_columns: &HashSet<String>,
    mapper: &dyn TypeMapper,
) -> Result<String> {
    validate_table_names(table)?;
    let definitions = column_definitions(table, special_columns, mapper, quote_pg)?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualify_pg(schema, &table.name)?,
        definitions.join(", ")
    ))
}

fn insert_prefix(qualified: &str, quoted_columns: &[String], overriding: bool) -> String {
    format!(
        "INSERT INTO {} ({}){} VALUES ",
        qualified,
        quoted_columns.join(", "),
        if overriding { " OVERRIDING SYSTEM VALUE" } else { "" }
    )
}

/// `(CAST($1::text AS integer), CAST($2::text AS text))` groups for `rows`
/// rows.
fn values_groups(rows: usize, types: &[String]) -> String {
    let mut param_idx = 1;
    let mut groups = Vec::with_capacity(rows);
    for _ in 0..rows {
        let casts: Vec<String> = types
            .iter()
            .map(|ty| {
                let p = format!("CAST(${}::text AS {})", param_idx, ty);
                param_idx += 1;
                p
            })
            .collect();
        groups.push(format!("({})", casts.join(", ")));
    }
    groups.join(", ")
}

fn rows_per_insert(cols_per_row: usize) -> usize {
    (MAX_PARAMS / cols_per_row.max(1)).max(1)
}

/// Batched multi-row `INSERT`, one transaction per batch.
struct PgInsertSink<'a> {
    client: &'a mut Object,
    insert_prefix: String,
    types: Vec<String>,
}

#[async_trait]
impl BatchSink for PgInsertSink<'_> {
    async fn write_batch(&mut self, _offset: usize, rows: &[Row]) -> Result<u64> {
        let tx = self.client.transaction().await?;
        let mut inserted = 0u64;

        for chunk in rows.chunks(rows_per_insert(self.types.len())) {
            let sql = format!(
                "{}{}",
                self.insert_prefix,
                values_groups(chunk.len(), &self.types)
            );
            let params: Vec<Option<String>> = chunk
                .iter()
                .flat_map(|row| row.iter().map(SqlValue::render_text))
                .collect();
            let param_refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

            tx.execute(sql.as_str(), &param_refs).await?;
            inserted += chunk.len() as u64;
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

/// Load every row through text-format `COPY` inside one transaction.
async fn copy_rows(
    client: &mut Object,
    qualified: &str,
    quoted_columns: &[String],
    rows: &[Row],
) -> Result<u64> {
    let copy_sql = format!(
        "COPY {} ({}) FROM STDIN",
        qualified,
        quoted_columns.join(", ")
    );

    let tx = client.transaction().await?;
    let sink = tx.copy_in(copy_sql.as_str()).await?;
    futures::pin_mut!(sink);

    for chunk in rows.chunks(COPY_CHUNK_ROWS) {
        let mut buf = BytesMut::with_capacity(chunk.len() * 128);
        for row in chunk {
            write_copy_line(&mut buf, row);
        }
        sink.send(buf.freeze()).await?;
    }

    let copied = sink.finish().await?;
    tx.commit().await?;
    Ok(copied)
}

/// Append one tab-separated COPY text line.
fn write_copy_line(buf: &mut BytesMut, row: &Row) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'\t');
        }
        match value.render_text() {
            Some(text) => buf.put_slice(escape_copy_text(&text).as_bytes()),
            None => buf.put_slice(b"\\N"),
        }
    }
    buf.put_u8(b'\n');
}

/// Escape text for PostgreSQL COPY.
fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}

/// Move the identity sequence past the highest imported value.
async fn sync_identity(client: &mut Object, qualified: &str, column: &str) -> Result<()> {
    let quoted = quote_pg(column)?;
    let sql = format!(
        "SELECT setval(pg_get_serial_sequence($1, $2), COALESCE(MAX({}), 0) + 1, false) FROM {}",
        quoted, qualified
    );
    client.query_one(sql.as_str(), &[&qualified, &column]).await?;
    debug!("Advanced identity sequence of {}.{}", qualified, column);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;
    use crate::core::schema::SourceColumn;
    use crate::core::SqlNullType;

    fn source(name: &str, data_type: &str, ordinal: i32) -> SourceColumn {
        SourceColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            max_length: Some(-1),
            precision: None,
            scale: None,
            is_nullable: true,
            ordinal_pos: ordinal,
        }
    }

    #[test]
    fn test_create_table_sql() {
        let info = TableInfo::from_columns(
            "Organization",
            vec![source("Id", "uniqueidentifier", 1), source("Name", "nvarchar", 2)],
            0,
        );
        let sql = create_table_sql("public", &info, &HashSet::new(), &MssqlToPostgresMapper).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"public\".\"Organization\" \
             (\"Id\" UUID NULL, \"Name\" TEXT NULL)"
        );
    }

    #[test]
    fn test_create_table_rejects_quote_in_name() {
        let info = TableInfo::from_columns("Org\"x", vec![source("Id", "int", 1)], 0);
        assert!(matches!(
            create_table_sql("public", &info, &HashSet::new(), &MssqlToPostgresMapper),
            Err(MigrateError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_values_groups_cast_text_params() {
        let types = vec!["integer".to_string(), "timestamp without time zone".to_string()];
        assert_eq!(
            values_groups(2, &types),
            "(CAST($1::text AS integer), CAST($2::text AS timestamp without time zone)), \
             (CAST($3::text AS integer), CAST($4::text AS timestamp without time zone))"
        );
    }

    #[test]
    fn test_insert_prefix_overriding() {
        let cols = vec!["\"Id\"".to_string(), "\"Name\"".to_string()];
        assert_eq!(
            insert_prefix("\"public\".\"T\"", &cols, true),
            "INSERT INTO \"public\".\"T\" (\"Id\", \"Name\") OVERRIDING SYSTEM VALUE VALUES "
        );
        assert!(!insert_prefix("\"public\".\"T\"", &cols, false).contains("OVERRIDING"));
    }

    #[test]
    fn test_rows_per_insert() {
        assert_eq!(rows_per_insert(5), 13107);
        assert_eq!(rows_per_insert(70000), 1);
    }

    #[test]
    fn test_copy_line_escapes_and_nulls() {
        let row: Row = vec![
            SqlValue::I32(1),
            SqlValue::Text(Cow::Borrowed("a\tb\nc\\d")),
            SqlValue::Null(SqlNullType::String),
            SqlValue::Bytes(Cow::Borrowed(&[0xde, 0xad])),
            SqlValue::Bool(true),
        ];
        let mut buf = BytesMut::new();
        write_copy_line(&mut buf, &row);
        assert_eq!(
            std::str::from_utf8(&buf).unwrap(),
            "1\ta\\tb\\nc\\\\d\t\\N\t\\\\xdead\ttrue\n"
        );
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut importer = PostgresImporter::new(DatabaseConfig::default());
        assert!(!importer.is_connected());
        let err = importer.disable_foreign_keys().await.unwrap_err();
        assert!(matches!(err, MigrateError::NotConnected("postgres")));
        importer.disconnect().await.unwrap();
    }
}
