//! SQL Server target importer.

use std::borrow::Cow;
use std::collections::HashSet;

use async_trait::async_trait;
use bb8::ManageConnection;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::Decimal;
use tiberius::{ColumnData, ToSql, TokenRow};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{self, MssqlClient, TiberiusConnectionManager, MSSQL_DEFAULT_SCHEMA};
use super::ledger::{self, MssqlLedgerStore};
use crate::config::DatabaseConfig;
use crate::core::batch::{import_in_batches, BatchSink, ColumnProjection};
use crate::core::identifier::{qualify_mssql, quote_mssql, validate_all, validate_or_reject};
use crate::core::schema::{column_definitions, validate_table_names, TableInfo};
use crate::core::traits::{Importer, TypeMapper};
use crate::core::value::{Row, SqlValue};
use crate::dialect::coerce::CoercionRules;
use crate::dialect::MssqlToMssqlMapper;
use crate::drivers::TargetKind;
use crate::error::{MigrateError, Result};

/// SQL Server parameter limit per statement.
const MAX_PARAMS: usize = 2100;

/// SQL Server row-constructor limit per `INSERT ... VALUES`.
const MAX_ROWS_PER_INSERT: usize = 1000;

/// Column metadata of an existing target table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TargetColumn {
    name: String,
    /// Lowercase catalog type, e.g. `"datetime2"`.
    data_type: String,
    scale: Option<i32>,
    is_identity: bool,
}

/// SQL Server importer.
pub struct MssqlImporter {
    config: DatabaseConfig,
    schema: String,
    client: Option<MssqlClient>,
}

impl MssqlImporter {
    /// Create a disconnected importer.
    pub fn new(config: DatabaseConfig) -> Self {
        let schema = config.schema_or(MSSQL_DEFAULT_SCHEMA).to_string();
        Self {
            config,
            schema,
            client: None,
        }
    }

    fn client_mut(&mut self) -> Result<&mut MssqlClient> {
        self.client
            .as_mut()
            .ok_or(MigrateError::NotConnected("sqlserver"))
    }

    async fn import(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
        batch_size: usize,
        use_bulk: bool,
    ) -> Result<u64> {
        validate_or_reject(table, "table name")?;
        validate_all(columns, "column name")?;
        let schema = self.schema.clone();
        let qualified = qualify_mssql(&schema, table)?;
        let client = self.client_mut()?;

        let target = load_target_columns(client, &schema, table).await?;
        if target.is_empty() {
            return Err(MigrateError::TableNotFound(table.to_string()));
        }
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
        let prepared = projection.prepare(rows, &types, &CoercionRules::SQLSERVER);

        let existing = connection::query_scalar_i64(
            client,
            &format!("SELECT COUNT_BIG(*) FROM {}", qualified),
        )
        .await?;
        if existing > 0 {
            warn!(
                "{}: target already holds {} rows, new rows are appended",
                table, existing
            );
        }

        let identity_supplied = projected.iter().any(|c| c.is_identity);
        if identity_supplied {
            connection::execute_batch(client, &format!("SET IDENTITY_INSERT {} ON", qualified))
                .await?;
            debug!("{}: IDENTITY_INSERT ON", table);
        }

        let bulk_rows = if use_bulk && !identity_supplied {
            encode_bulk_rows(&projection.columns, &prepared, &target)
        } else {
            None
        };

        let result = match bulk_rows {
            Some(encoded) => {
                debug!("{}: using TDS bulk load", table);
                let mut sink = BulkSink {
                    client: &mut *client,
                    table: qualified.clone(),
                    encoded: encoded.into_iter(),
                };
                import_in_batches(&mut sink, table, &prepared, batch_size).await
            }
            None => {
                if use_bulk {
                    debug!("{}: bulk load not applicable, using batched INSERT", table);
                }
                let mut sink = InsertSink {
                    client: &mut *client,
                    table: qualified.clone(),
                    columns: projection
                        .columns
                        .iter()
                        .map(|c| quote_mssql(c))
                        .collect::<Result<Vec<_>>>()?,
                    types,
                };
                import_in_batches(&mut sink, table, &prepared, batch_size).await
            }
        };

        if identity_supplied {
            let off = format!("SET IDENTITY_INSERT {} OFF", qualified);
            if let Err(e) = connection::execute_batch(client, &off).await {
                warn!("{}: failed to reset IDENTITY_INSERT: {}", table, e);
            }
        }

        let written = result?;
        let after =
            connection::query_scalar_i64(client, &format!("SELECT COUNT_BIG(*) FROM {}", qualified))
                .await?;
        let expected = existing + written as i64;
        if after < expected {
            return Err(MigrateError::Validation(format!(
                "{}: expected at least {} rows after import, found {}",
                table, expected, after
            )));
        }

        info!("{}: imported {} rows", table, written);
        Ok(written)
    }
}

#[async_trait]
impl Importer for MssqlImporter {
    fn kind(&self) -> TargetKind {
        TargetKind::SqlServer
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        validate_or_reject(&self.schema, "schema name")?;

        let manager = TiberiusConnectionManager::new(self.config.clone());
        let target = manager.describe();
        let client = manager
            .connect()
            .await
            .map_err(|e| MigrateError::connection("sqlserver", format!("{}: {}", target, e)))?;

        info!("Connected to MSSQL target: {}", target);
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await?;
            debug!("Disconnected from MSSQL target");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn test_connection(&mut self) -> Result<()> {
        connection::check_connection(&self.config).await?;
        info!("MSSQL target connection OK");
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT CASE WHEN {} IS NULL THEN 0 ELSE 1 END",
            object_id(&self.schema, table)?
        );
        let client = self.client_mut()?;
        Ok(connection::query_scalar_i64(client, &sql).await? == 1)
    }

    async fn create_table_from_schema(
        &mut self,
        table: &TableInfo,
        special_columns: &HashSet<String>,
    ) -> Result<()> {
        let sql = create_table_sql(&self.schema, table, special_columns, &MssqlToMssqlMapper)?;
        if self.table_exists(&table.name).await? {
            debug!("{}: table already exists", table.name);
            return Ok(());
        }

        let client = self.client_mut()?;
        connection::execute_batch(client, &sql).await?;
        info!("Created table {}.{}", self.schema, table.name);
        Ok(())
    }

    async fn get_columns(&mut self, table: &str) -> Result<Vec<String>> {
        validate_or_reject(table, "table name")?;
        let schema = self.schema.clone();
        let client = self.client_mut()?;
        let columns = load_target_columns(client, &schema, table).await?;
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
        let sql = format!(
            "IF {} IS NOT NULL DROP TABLE {}",
            object_id(&self.schema, table)?,
            qualify_mssql(&self.schema, table)?
        );
        let client = self.client_mut()?;
        connection::execute_batch(client, &sql).await?;
        info!("Dropped table {}.{} (if it existed)", self.schema, table);
        Ok(())
    }

    async fn row_count(&mut self, table: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT_BIG(*) FROM {}",
            qualify_mssql(&self.schema, table)?
        );
        let client = self.client_mut()?;
        connection::query_scalar_i64(client, &sql).await
    }

    async fn disable_foreign_keys(&mut self) -> Result<()> {
        let client = self.client_mut()?;
        ledger::disable_foreign_keys(&mut MssqlLedgerStore::new(client)).await?;
        Ok(())
    }

    async fn enable_foreign_keys(&mut self) -> Result<()> {
        let client = self.client_mut()?;
        ledger::enable_foreign_keys(&mut MssqlLedgerStore::new(client)).await?;
        Ok(())
    }
}

fn object_id(schema: &str, table: &str) -> Result<String> {
    Ok(format!("OBJECT_ID(N'{}', N'U')", qualify_mssql(schema, table)?))
}

fn create_table_sql(
    schema: &str,
    table: &TableInfo,
    special_columns: &HashSet<String>,
    mapper: &dyn TypeMapper,
) -> Result<String> {
    validate_table_names(table)?;
    let definitions = column_definitions(table, special_columns, mapper, quote_mssql)?;
    Ok(format!(
        "IF {} IS NULL CREATE TABLE {} ({})",
        object_id(schema, &table.name)?,
        qualify_mssql(schema, &table.name)?,
        definitions.join(", ")
    ))
}

async fn load_target_columns(
    client: &mut MssqlClient,
    schema: &str,
    table: &str,
) -> Result<Vec<TargetColumn>> {
    let query = r#"
        SELECT
            COLUMN_NAME,
            DATA_TYPE,
            NUMERIC_SCALE,
            COLUMNPROPERTY(OBJECT_ID(QUOTENAME(TABLE_SCHEMA) + '.' + QUOTENAME(TABLE_NAME)),
                           COLUMN_NAME, 'IsIdentity')
        FROM INFORMATION_SCHEMA.COLUMNS
        WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
        ORDER BY ORDINAL_POSITION
    "#;
    let rows = client
        .query(query, &[&schema, &table])
        .await?
        .into_first_result()
        .await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: &str = row.try_get(0)?.unwrap_or_default();
        let data_type: &str = row.try_get(1)?.unwrap_or_default();
        columns.push(TargetColumn {
            name: name.to_string(),
            data_type: data_type.to_ascii_lowercase(),
            scale: row.try_get::<i32, _>(2)?,
            is_identity: row.try_get::<i32, _>(3)?.unwrap_or(0) == 1,
        });
    }
    Ok(columns)
}

/// Batched multi-row `INSERT`, one transaction per batch.
struct InsertSink<'a> {
    client: &'a mut MssqlClient,
    table: String,
    columns: Vec<String>,
    types: Vec<String>,
}

impl InsertSink<'_> {
    async fn insert_chunks(&mut self, rows: &[Row]) -> Result<u64> {
        let cols_per_row = self.columns.len();
        let col_str = self.columns.join(", ");
        let mut inserted = 0u64;

        for chunk in rows.chunks(rows_per_insert(cols_per_row)) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                self.table,
                col_str,
                values_placeholders(chunk.len(), cols_per_row)
            );

            let params: Vec<Box<dyn ToSql>> = chunk
                .iter()
                .flat_map(|row| {
                    row.iter()
                        .enumerate()
                        .map(|(i, v)| to_param(v, self.types.get(i).map(String::as_str).unwrap_or("")))
                })
                .collect();
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

            self.client.execute(sql.as_str(), &param_refs).await?;
            inserted += chunk.len() as u64;
        }

        Ok(inserted)
    }
}

#[async_trait]
impl BatchSink for InsertSink<'_> {
    async fn write_batch(&mut self, _offset: usize, rows: &[Row]) -> Result<u64> {
        connection::execute_batch(self.client, "BEGIN TRAN").await?;
        match self.insert_chunks(rows).await {
            Ok(n) => {
                connection::execute_batch(self.client, "COMMIT TRAN").await?;
                Ok(n)
            }
            Err(e) => {
                if let Err(rollback_err) =
                    connection::execute_batch(self.client, "IF @@TRANCOUNT > 0 ROLLBACK TRAN").await
                {
                    warn!("{}: rollback failed: {}", self.table, rollback_err);
                }
                Err(e)
            }
        }
    }
}

/// TDS bulk load, one bulk statement per batch.
struct BulkSink<'a> {
    client: &'a mut MssqlClient,
    table: String,
    encoded: std::vec::IntoIter<Vec<ColumnData<'static>>>,
}

#[async_trait]
impl BatchSink for BulkSink<'_> {
    async fn write_batch(&mut self, _offset: usize, rows: &[Row]) -> Result<u64> {
        let mut bulk_load = self.client.bulk_insert(&self.table).await?;

        let mut sent = 0u64;
        for values in self.encoded.by_ref().take(rows.len()) {
            let mut token_row = TokenRow::new();
            for value in values {
                token_row.push(value);
            }
            bulk_load.send(token_row).await?;
            sent += 1;
        }

        bulk_load.finalize().await?;
        Ok(sent)
    }
}

fn rows_per_insert(cols_per_row: usize) -> usize {
    (MAX_PARAMS / cols_per_row.max(1)).clamp(1, MAX_ROWS_PER_INSERT)
}

/// `(@P1, @P2), (@P3, @P4)` for 2 rows of 2 columns.
fn values_placeholders(rows: usize, cols_per_row: usize) -> String {
    let mut param_idx = 1;
    let mut groups = Vec::with_capacity(rows);
    for _ in 0..rows {
        let placeholders: Vec<String> = (0..cols_per_row)
            .map(|_| {
                let p = format!("@P{}", param_idx);
                param_idx += 1;
                p
            })
            .collect();
        groups.push(format!("({})", placeholders.join(", ")));
    }
    groups.join(", ")
}

fn is_binary_type(data_type: &str) -> bool {
    matches!(data_type, "binary" | "varbinary" | "image")
}

fn is_char_type(data_type: &str) -> bool {
    data_type.contains("char") || data_type.contains("text")
}

/// Bind a value as a statement parameter. NULLs take the type of the
/// destination column so the server does not reject the implicit conversion.
fn to_param(value: &SqlValue<'_>, data_type: &str) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(_) => null_param(data_type),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::I64(i) => Box::new(*i),
        SqlValue::F32(f) => Box::new(*f),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::Text(s) => Box::new(s.to_string()),
        SqlValue::Bytes(b) => Box::new(b.to_vec()),
        SqlValue::Uuid(u) => Box::new(*u),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
        SqlValue::Date(d) => Box::new(*d),
        SqlValue::Time(t) => Box::new(*t),
    }
}

fn null_param(data_type: &str) -> Box<dyn ToSql> {
    match data_type {
        "bit" => Box::new(Option::<bool>::None),
        "tinyint" => Box::new(Option::<u8>::None),
        "smallint" => Box::new(Option::<i16>::None),
        "int" => Box::new(Option::<i32>::None),
        "bigint" => Box::new(Option::<i64>::None),
        "real" => Box::new(Option::<f32>::None),
        "float" => Box::new(Option::<f64>::None),
        "decimal" | "numeric" | "money" | "smallmoney" => Box::new(Option::<Decimal>::None),
        "uniqueidentifier" => Box::new(Option::<Uuid>::None),
        "date" => Box::new(Option::<NaiveDate>::None),
        "time" => Box::new(Option::<NaiveTime>::None),
        "datetime" | "datetime2" | "smalldatetime" => Box::new(Option::<NaiveDateTime>::None),
        "datetimeoffset" => Box::new(Option::<DateTime<FixedOffset>>::None),
        t if is_binary_type(t) => Box::new(Option::<Vec<u8>>::None),
        _ => Box::new(Option::<String>::None),
    }
}

/// Encode every row for a bulk load into `target`, in target column order.
///
/// Returns `None` when the projection does not cover every target column or
/// some value has no encoding for its destination type; the caller then
/// uses batched INSERTs.
fn encode_bulk_rows(
    projected: &[String],
    rows: &[Row],
    target: &[TargetColumn],
) -> Option<Vec<Vec<ColumnData<'static>>>> {
    if target.iter().any(|c| c.is_identity) {
        return None;
    }
    let order: Vec<usize> = target
        .iter()
        .map(|t| projected.iter().position(|p| p == &t.name))
        .collect::<Option<Vec<_>>>()?;

    rows.iter()
        .map(|row| {
            order
                .iter()
                .zip(target)
                .map(|(&idx, column)| encode_for_column(row.get(idx)?, column))
                .collect::<Option<Vec<_>>>()
        })
        .collect()
}

fn tds_date(date: NaiveDate) -> Option<tiberius::time::Date> {
    let epoch = NaiveDate::from_ymd_opt(1, 1, 1)?;
    let days = u32::try_from((date - epoch).num_days()).ok()?;
    Some(tiberius::time::Date::new(days))
}

fn tds_time(time: NaiveTime) -> tiberius::time::Time {
    let nanos = u64::from(time.num_seconds_from_midnight()) * 1_000_000_000
        + u64::from(time.nanosecond() % 1_000_000_000);
    tiberius::time::Time::new(nanos / 100, 7)
}

fn tds_datetime2(dt: NaiveDateTime) -> Option<tiberius::time::DateTime2> {
    Some(tiberius::time::DateTime2::new(tds_date(dt.date())?, tds_time(dt.time())))
}

/// Legacy `datetime`: days since 1900-01-01 and 1/300 second ticks.
fn tds_datetime(dt: NaiveDateTime) -> Option<tiberius::time::DateTime> {
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)?;
    let days = i32::try_from((dt.date() - epoch).num_days()).ok()?;
    let time = dt.time();
    let millis = u64::from(time.num_seconds_from_midnight()) * 1000
        + u64::from((time.nanosecond() % 1_000_000_000) / 1_000_000);
    let ticks = u32::try_from(millis * 3 / 10).ok()?;
    Some(tiberius::time::DateTime::new(days, ticks))
}

/// `smalldatetime`: days since 1900-01-01 and minutes since midnight.
fn tds_smalldatetime(dt: NaiveDateTime) -> Option<tiberius::time::SmallDateTime> {
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)?;
    let days = u16::try_from((dt.date() - epoch).num_days()).ok()?;
    let minutes = u16::try_from(dt.time().num_seconds_from_midnight() / 60).ok()?;
    Some(tiberius::time::SmallDateTime::new(days, minutes))
}

fn typed_null(data_type: &str) -> ColumnData<'static> {
    match data_type {
        "bit" => ColumnData::Bit(None),
        "tinyint" => ColumnData::U8(None),
        "smallint" => ColumnData::I16(None),
        "int" => ColumnData::I32(None),
        "bigint" => ColumnData::I64(None),
        "real" => ColumnData::F32(None),
        "float" => ColumnData::F64(None),
        "decimal" | "numeric" | "money" | "smallmoney" => ColumnData::Numeric(None),
        "uniqueidentifier" => ColumnData::Guid(None),
        "date" => ColumnData::Date(None),
        "time" => ColumnData::Time(None),
        "datetime" => ColumnData::DateTime(None),
        "smalldatetime" => ColumnData::SmallDateTime(None),
        "datetime2" => ColumnData::DateTime2(None),
        "datetimeoffset" => ColumnData::DateTimeOffset(None),
        t if is_binary_type(t) => ColumnData::Binary(None),
        _ => ColumnData::String(None),
    }
}

fn integer_value(value: &SqlValue<'_>) -> Option<i64> {
    match value {
        SqlValue::Bool(b) => Some(i64::from(*b)),
        SqlValue::I16(v) => Some(i64::from(*v)),
        SqlValue::I32(v) => Some(i64::from(*v)),
        SqlValue::I64(v) => Some(*v),
        _ => None,
    }
}

fn as_naive(value: &SqlValue<'_>) -> Option<NaiveDateTime> {
    match value {
        SqlValue::DateTime(dt) => Some(*dt),
        SqlValue::Date(d) => d.and_hms_opt(0, 0, 0),
        SqlValue::DateTimeOffset(dto) => Some(dto.naive_local()),
        _ => None,
    }
}

/// Encode one value for a destination column of a bulk load.
fn encode_for_column(value: &SqlValue<'_>, column: &TargetColumn) -> Option<ColumnData<'static>> {
    let data_type = column.data_type.as_str();
    if value.is_null() {
        return Some(typed_null(data_type));
    }

    let encoded = match data_type {
        "bit" => ColumnData::Bit(Some(integer_value(value)? != 0)),
        "tinyint" => ColumnData::U8(Some(u8::try_from(integer_value(value)?).ok()?)),
        "smallint" => ColumnData::I16(Some(i16::try_from(integer_value(value)?).ok()?)),
        "int" => ColumnData::I32(Some(i32::try_from(integer_value(value)?).ok()?)),
        "bigint" => ColumnData::I64(Some(integer_value(value)?)),
        "real" => match value {
            SqlValue::F32(f) if f.is_finite() => ColumnData::F32(Some(*f)),
            _ => return None,
        },
        "float" => match value {
            SqlValue::F64(f) if f.is_finite() => ColumnData::F64(Some(*f)),
            SqlValue::F32(f) if f.is_finite() => ColumnData::F64(Some(f64::from(*f))),
            _ => return None,
        },
        "decimal" | "numeric" | "money" | "smallmoney" => {
            let SqlValue::Decimal(d) = value else {
                return None;
            };
            let scale = u32::try_from(column.scale.unwrap_or(0)).ok()?;
            let mut d = *d;
            d.rescale(scale);
            ColumnData::Numeric(Some(tiberius::numeric::Numeric::new_with_scale(
                d.mantissa(),
                u8::try_from(d.scale()).ok()?,
            )))
        }
        "uniqueidentifier" => match value {
            SqlValue::Uuid(u) => ColumnData::Guid(Some(*u)),
            SqlValue::Text(s) => ColumnData::Guid(Some(Uuid::parse_str(s.trim()).ok()?)),
            _ => return None,
        },
        "date" => match value {
            SqlValue::Date(d) => ColumnData::Date(Some(tds_date(*d)?)),
            SqlValue::DateTime(dt) => ColumnData::Date(Some(tds_date(dt.date())?)),
            _ => return None,
        },
        "time" => match value {
            SqlValue::Time(t) => ColumnData::Time(Some(tds_time(*t))),
            _ => return None,
        },
        "datetime" => ColumnData::DateTime(Some(tds_datetime(as_naive(value)?)?)),
        "smalldatetime" => ColumnData::SmallDateTime(Some(tds_smalldatetime(as_naive(value)?)?)),
        "datetime2" => ColumnData::DateTime2(Some(tds_datetime2(as_naive(value)?)?)),
        "datetimeoffset" => match value {
            SqlValue::DateTimeOffset(dto) => {
                let utc = tds_datetime2(dto.naive_utc())?;
                let offset = i16::try_from(dto.offset().local_minus_utc() / 60).ok()?;
                ColumnData::DateTimeOffset(Some(tiberius::time::DateTimeOffset::new(utc, offset)))
            }
            SqlValue::DateTime(dt) => ColumnData::DateTimeOffset(Some(
                tiberius::time::DateTimeOffset::new(tds_datetime2(*dt)?, 0),
            )),
            _ => return None,
        },
        t if is_binary_type(t) => match value {
            SqlValue::Bytes(b) => ColumnData::Binary(Some(Cow::Owned(b.to_vec()))),
            _ => return None,
        },
        t if is_char_type(t) => match value {
            SqlValue::Bytes(_) => return None,
            other => ColumnData::String(Some(Cow::Owned(other.render_text()?))),
        },
        _ => return None,
    };
    Some(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::SourceColumn;

    fn target(name: &str, data_type: &str) -> TargetColumn {
        TargetColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            scale: None,
            is_identity: false,
        }
    }

    fn source(name: &str, data_type: &str, ordinal: i32, max_length: Option<i32>) -> SourceColumn {
        SourceColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            max_length,
            precision: None,
            scale: None,
            is_nullable: ordinal != 1,
            ordinal_pos: ordinal,
        }
    }

    #[test]
    fn test_rows_per_insert_respects_limits() {
        assert_eq!(rows_per_insert(1), 1000);
        assert_eq!(rows_per_insert(3), 700);
        assert_eq!(rows_per_insert(10), 210);
        assert_eq!(rows_per_insert(3000), 1);
        assert_eq!(rows_per_insert(0), 1000);
    }

    #[test]
    fn test_values_placeholders() {
        assert_eq!(values_placeholders(2, 2), "(@P1, @P2), (@P3, @P4)");
        assert_eq!(values_placeholders(1, 3), "(@P1, @P2, @P3)");
    }

    #[test]
    fn test_create_table_sql() {
        let info = TableInfo::from_columns(
            "Users",
            vec![
                source("Id", "int", 1, None),
                source("Email", "nvarchar", 2, Some(256)),
                source("Data", "nvarchar", 3, Some(500)),
            ],
            0,
        );
        let special = HashSet::from(["Data".to_string()]);
        let sql = create_table_sql("dbo", &info, &special, &MssqlToMssqlMapper).unwrap();
        assert_eq!(
            sql,
            "IF OBJECT_ID(N'[dbo].[Users]', N'U') IS NULL CREATE TABLE [dbo].[Users] \
             ([Id] INT NOT NULL, [Email] NVARCHAR(256) NULL, [Data] NVARCHAR(MAX) NULL)"
        );
    }

    #[test]
    fn test_create_table_rejects_bad_names() {
        let info = TableInfo::from_columns("Users'", vec![source("Id", "int", 1, None)], 0);
        let err = create_table_sql("dbo", &info, &HashSet::new(), &MssqlToMssqlMapper).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidIdentifier { .. }));

        let info = TableInfo::from_columns("Users", vec![source("Id;--", "int", 1, None)], 0);
        assert!(create_table_sql("dbo", &info, &HashSet::new(), &MssqlToMssqlMapper).is_err());
    }

    #[test]
    fn test_encode_integers_follow_destination_width() {
        assert!(matches!(
            encode_for_column(&SqlValue::I32(1), &target("Flag", "bit")),
            Some(ColumnData::Bit(Some(true)))
        ));
        assert!(matches!(
            encode_for_column(&SqlValue::I16(200), &target("T", "tinyint")),
            Some(ColumnData::U8(Some(200)))
        ));
        assert!(encode_for_column(&SqlValue::I16(-1), &target("T", "tinyint")).is_none());
        assert!(matches!(
            encode_for_column(&SqlValue::I32(7), &target("B", "bigint")),
            Some(ColumnData::I64(Some(7)))
        ));
    }

    #[test]
    fn test_encode_nulls_are_typed_by_destination() {
        let null = SqlValue::Null(crate::core::SqlNullType::String);
        assert!(matches!(
            encode_for_column(&null, &target("Blob", "varbinary")),
            Some(ColumnData::Binary(None))
        ));
        assert!(matches!(
            encode_for_column(&null, &target("At", "datetime")),
            Some(ColumnData::DateTime(None))
        ));
        assert!(matches!(
            encode_for_column(&null, &target("Name", "nvarchar")),
            Some(ColumnData::String(None))
        ));
    }

    #[test]
    fn test_encode_legacy_datetime() {
        let dt = NaiveDate::from_ymd_opt(1900, 1, 2)
            .unwrap()
            .and_hms_milli_opt(0, 0, 1, 0)
            .unwrap();
        match encode_for_column(&SqlValue::DateTime(dt), &target("At", "datetime")) {
            Some(ColumnData::DateTime(Some(v))) => {
                assert_eq!(v.days(), 1);
                assert_eq!(v.seconds_fragments(), 300);
            }
            other => panic!("unexpected encoding: {other:?}"),
        }
    }

    #[test]
    fn test_encode_decimal_rescaled_to_column() {
        let mut column = target("Amount", "decimal");
        column.scale = Some(4);
        let value = SqlValue::Decimal(Decimal::new(1234, 2));
        match encode_for_column(&value, &column) {
            Some(ColumnData::Numeric(Some(n))) => {
                assert_eq!(n.scale(), 4);
                assert_eq!(n.value(), 123400);
            }
            other => panic!("unexpected encoding: {other:?}"),
        }
    }

    #[test]
    fn test_bulk_rows_reordered_to_target() {
        let target_cols = vec![target("Id", "int"), target("Name", "nvarchar")];
        let projected = vec!["Name".to_string(), "Id".to_string()];
        let rows: Vec<Row> = vec![vec![SqlValue::Text(Cow::Borrowed("Ann")), SqlValue::I32(1)]];

        let encoded = encode_bulk_rows(&projected, &rows, &target_cols).unwrap();
        assert!(matches!(encoded[0][0], ColumnData::I32(Some(1))));
        assert!(matches!(&encoded[0][1], ColumnData::String(Some(s)) if s == "Ann"));
    }

    #[test]
    fn test_bulk_not_used_for_partial_or_identity_tables() {
        let rows: Vec<Row> = vec![vec![SqlValue::I32(1)]];
        let target_cols = vec![target("Id", "int"), target("Name", "nvarchar")];
        assert!(encode_bulk_rows(&["Id".to_string()], &rows, &target_cols).is_none());

        let mut identity = target("Id", "int");
        identity.is_identity = true;
        assert!(encode_bulk_rows(&["Id".to_string()], &rows, &[identity]).is_none());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut importer = MssqlImporter::new(DatabaseConfig::default());
        let err = importer.row_count("Users").await.unwrap_err();
        assert!(matches!(err, MigrateError::NotConnected("sqlserver")));
        importer.disconnect().await.unwrap();
    }
}
