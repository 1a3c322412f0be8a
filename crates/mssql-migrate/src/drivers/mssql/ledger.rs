//! Constraint tracking ledger for SQL Server targets.
//!
//! SQL Server has no session-wide switch for foreign key enforcement, so
//! every enabled foreign key is disabled individually and recorded in a
//! table inside the target database. The table outlives the process: a run
//! that crashes after disabling finds the ledger on restart and leaves the
//! constraints alone, and the final re-enable touches only the constraints
//! this engine disabled.
//!
//! States:
//!
//! ```text
//! NoLedger --disable--> ConstraintsDisabled --enable--> NoLedger
//!                        |  ^
//!                        +--+ disable (no-op)
//! ```

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use super::connection::{self, MssqlClient};
use crate::core::identifier::{qualify_mssql, quote_mssql};
use crate::error::{MigrateError, Result};

/// Schema holding the ledger table.
pub const LEDGER_SCHEMA: &str = "dbo";

/// Ledger table name.
pub const LEDGER_TABLE: &str = "_MigrationDisabledConstraint";

/// A foreign key constraint on a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstraintRef {
    pub schema: String,
    pub table: String,
    pub name: String,
}

impl ConstraintRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ConstraintRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.schema, self.table, self.name)
    }
}

/// A foreign key with its current enforcement state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyState {
    pub constraint: ConstraintRef,
    pub is_disabled: bool,
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub constraint: ConstraintRef,
    /// The constraint was already disabled before the migration started.
    pub pre_existing_disabled: bool,
    /// Set by the store on insert.
    pub disabled_at: Option<NaiveDateTime>,
}

/// Where the target currently is in the ledger state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    NoLedger,
    ConstraintsDisabled,
}

/// Storage and catalog primitives the ledger state machine runs on.
#[async_trait]
pub trait LedgerStore: Send {
    async fn ledger_exists(&mut self) -> Result<bool>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Create the empty ledger table.
    async fn create_ledger(&mut self) -> Result<()>;

    /// Every foreign key in the database with its disabled flag.
    async fn list_foreign_keys(&mut self) -> Result<Vec<ForeignKeyState>>;

    async fn disable_constraint(&mut self, constraint: &ConstraintRef) -> Result<()>;

    async fn record(&mut self, entry: &LedgerEntry) -> Result<()>;

    async fn read_entries(&mut self) -> Result<Vec<LedgerEntry>>;

    async fn enable_constraint(&mut self, constraint: &ConstraintRef) -> Result<()>;

    /// Drop the ledger table if it exists.
    async fn drop_ledger(&mut self) -> Result<()>;
}

/// Current state of the ledger.
pub async fn ledger_state<S>(store: &mut S) -> Result<LedgerState>
where
    S: LedgerStore + ?Sized,
{
    if store.ledger_exists().await? {
        Ok(LedgerState::ConstraintsDisabled)
    } else {
        Ok(LedgerState::NoLedger)
    }
}

/// Disable every enabled foreign key and record it in a new ledger.
///
/// Constraints that were already disabled are recorded as pre-existing.
/// All of it happens in one transaction; on failure the transaction is
/// rolled back and no ledger exists afterwards. When a ledger already
/// exists the call does nothing.
///
/// Returns the number of constraints this call disabled.
pub async fn disable_foreign_keys<S>(store: &mut S) -> Result<usize>
where
    S: LedgerStore + ?Sized,
{
    if ledger_state(store).await? == LedgerState::ConstraintsDisabled {
        info!("Constraint ledger already present, foreign keys are already disabled");
        return Ok(0);
    }

    store.begin().await?;
    match disable_in_transaction(store).await {
        Ok((disabled, pre_existing)) => {
            store.commit().await?;
            info!(
                "Disabled {} foreign key constraints ({} already disabled)",
                disabled, pre_existing
            );
            Ok(disabled)
        }
        Err(e) => {
            if let Err(rollback_err) = store.rollback().await {
                warn!("Rollback of constraint ledger failed: {}", rollback_err);
            }
            Err(e)
        }
    }
}

async fn disable_in_transaction<S>(store: &mut S) -> Result<(usize, usize)>
where
    S: LedgerStore + ?Sized,
{
    store.create_ledger().await?;
    let keys = store.list_foreign_keys().await?;

    let mut pre_existing = 0;
    for key in keys.iter().filter(|k| k.is_disabled) {
        store
            .record(&LedgerEntry {
                constraint: key.constraint.clone(),
                pre_existing_disabled: true,
                disabled_at: None,
            })
            .await?;
        pre_existing += 1;
    }

    let mut disabled = 0;
    for key in keys.iter().filter(|k| !k.is_disabled) {
        store
            .disable_constraint(&key.constraint)
            .await
            .map_err(|e| wrap_constraint_error(&key.constraint, e))?;
        store
            .record(&LedgerEntry {
                constraint: key.constraint.clone(),
                pre_existing_disabled: false,
                disabled_at: None,
            })
            .await?;
        debug!("Disabled constraint {}", key.constraint);
        disabled += 1;
    }

    Ok((disabled, pre_existing))
}

fn wrap_constraint_error(constraint: &ConstraintRef, e: MigrateError) -> MigrateError {
    match e {
        MigrateError::ConstraintOperationFailure { .. } | MigrateError::InvalidIdentifier { .. } => e,
        other => MigrateError::constraint(constraint.to_string(), other),
    }
}

/// Re-enable the constraints recorded as disabled by this engine, then drop
/// the ledger.
///
/// Constraints come back without revalidating existing rows, so child rows
/// orphaned by a partially imported parent do not block the re-enable. A
/// constraint that still fails to re-enable is logged and skipped. The
/// ledger is dropped even when some re-enables failed.
///
/// Returns the number of constraints re-enabled.
pub async fn enable_foreign_keys<S>(store: &mut S) -> Result<usize>
where
    S: LedgerStore + ?Sized,
{
    if ledger_state(store).await? == LedgerState::NoLedger {
        debug!("No constraint ledger, nothing to re-enable");
        return Ok(0);
    }

    let entries = store.read_entries().await?;
    let owned: Vec<&LedgerEntry> = entries.iter().filter(|e| !e.pre_existing_disabled).collect();

    let mut enabled = 0;
    for entry in &owned {
        match store.enable_constraint(&entry.constraint).await {
            Ok(()) => {
                debug!("Re-enabled constraint {}", entry.constraint);
                enabled += 1;
            }
            Err(e) => {
                let e = wrap_constraint_error(&entry.constraint, e);
                warn!("Could not re-enable constraint {}: {}", entry.constraint, e);
            }
        }
    }

    store.drop_ledger().await?;
    if enabled < owned.len() {
        warn!(
            "Re-enabled {}/{} constraints; the rest stay disabled",
            enabled,
            owned.len()
        );
    } else {
        info!("Re-enabled {}/{} constraints", enabled, owned.len());
    }
    Ok(enabled)
}

/// Ledger store backed by a SQL Server session.
pub struct MssqlLedgerStore<'a> {
    client: &'a mut MssqlClient,
}

impl<'a> MssqlLedgerStore<'a> {
    pub fn new(client: &'a mut MssqlClient) -> Self {
        Self { client }
    }
}

fn ledger_table() -> Result<String> {
    qualify_mssql(LEDGER_SCHEMA, LEDGER_TABLE)
}

fn ledger_object_id() -> String {
    format!("OBJECT_ID(N'{}.{}', N'U')", LEDGER_SCHEMA, LEDGER_TABLE)
}

fn create_ledger_sql() -> Result<String> {
    Ok(format!(
        "CREATE TABLE {} (\
         SchemaName NVARCHAR(128) NOT NULL, \
         TableName NVARCHAR(128) NOT NULL, \
         ConstraintName NVARCHAR(128) NOT NULL, \
         PreExistingDisabled BIT NOT NULL, \
         DisabledAt DATETIME2 NOT NULL DEFAULT SYSUTCDATETIME())",
        ledger_table()?
    ))
}

fn alter_constraint_sql(constraint: &ConstraintRef, enable: bool) -> Result<String> {
    let table = qualify_mssql(&constraint.schema, &constraint.table)?;
    let name = quote_mssql(&constraint.name)?;
    Ok(if enable {
        format!("ALTER TABLE {} CHECK CONSTRAINT {}", table, name)
    } else {
        format!("ALTER TABLE {} NOCHECK CONSTRAINT {}", table, name)
    })
}

#[async_trait]
impl LedgerStore for MssqlLedgerStore<'_> {
    async fn ledger_exists(&mut self) -> Result<bool> {
        let sql = format!(
            "SELECT CASE WHEN {} IS NULL THEN 0 ELSE 1 END",
            ledger_object_id()
        );
        Ok(connection::query_scalar_i64(self.client, &sql).await? == 1)
    }

    async fn begin(&mut self) -> Result<()> {
        connection::execute_batch(self.client, "BEGIN TRAN").await
    }

    async fn commit(&mut self) -> Result<()> {
        connection::execute_batch(self.client, "COMMIT TRAN").await
    }

    async fn rollback(&mut self) -> Result<()> {
        connection::execute_batch(self.client, "IF @@TRANCOUNT > 0 ROLLBACK TRAN").await
    }

    async fn create_ledger(&mut self) -> Result<()> {
        connection::execute_batch(self.client, &create_ledger_sql()?).await
    }

    async fn list_foreign_keys(&mut self) -> Result<Vec<ForeignKeyState>> {
        let sql = r#"
            SELECT
                OBJECT_SCHEMA_NAME(fk.parent_object_id),
                OBJECT_NAME(fk.parent_object_id),
                fk.name,
                fk.is_disabled
            FROM sys.foreign_keys fk
            ORDER BY 1, 2, 3
        "#;
        let rows = self.client.simple_query(sql).await?.into_first_result().await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let schema: &str = row.try_get(0)?.unwrap_or_default();
            let table: &str = row.try_get(1)?.unwrap_or_default();
            let name: &str = row.try_get(2)?.unwrap_or_default();
            let is_disabled: bool = row.try_get(3)?.unwrap_or(false);
            keys.push(ForeignKeyState {
                constraint: ConstraintRef::new(schema, table, name),
                is_disabled,
            });
        }
        Ok(keys)
    }

    async fn disable_constraint(&mut self, constraint: &ConstraintRef) -> Result<()> {
        let sql = alter_constraint_sql(constraint, false)?;
        connection::execute_batch(self.client, &sql).await
    }

    async fn record(&mut self, entry: &LedgerEntry) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (SchemaName, TableName, ConstraintName, PreExistingDisabled) \
             VALUES (@P1, @P2, @P3, @P4)",
            ledger_table()?
        );
        self.client
            .execute(
                sql.as_str(),
                &[
                    &entry.constraint.schema.as_str(),
                    &entry.constraint.table.as_str(),
                    &entry.constraint.name.as_str(),
                    &entry.pre_existing_disabled,
                ],
            )
            .await?;
        Ok(())
    }

    async fn read_entries(&mut self) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT SchemaName, TableName, ConstraintName, PreExistingDisabled, DisabledAt \
             FROM {} ORDER BY SchemaName, TableName, ConstraintName",
            ledger_table()?
        );
        let rows = self
            .client
            .simple_query(sql)
            .await?
            .into_first_result()
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let schema: &str = row.try_get(0)?.unwrap_or_default();
            let table: &str = row.try_get(1)?.unwrap_or_default();
            let name: &str = row.try_get(2)?.unwrap_or_default();
            entries.push(LedgerEntry {
                constraint: ConstraintRef::new(schema, table, name),
                pre_existing_disabled: row.try_get(3)?.unwrap_or(false),
                disabled_at: row.try_get::<NaiveDateTime, _>(4)?,
            });
        }
        Ok(entries)
    }

    async fn enable_constraint(&mut self, constraint: &ConstraintRef) -> Result<()> {
        let sql = alter_constraint_sql(constraint, true)?;
        connection::execute_batch(self.client, &sql).await
    }

    async fn drop_ledger(&mut self) -> Result<()> {
        let sql = format!(
            "IF {} IS NOT NULL DROP TABLE {}",
            ledger_object_id(),
            ledger_table()?
        );
        connection::execute_batch(self.client, &sql).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[derive(Clone, Default)]
    struct Snapshot {
        ledger: Option<Vec<LedgerEntry>>,
        keys: Vec<ForeignKeyState>,
    }

    /// Transactional in-memory catalog.
    #[derive(Default)]
    struct MemoryStore {
        state: Snapshot,
        saved: Option<Snapshot>,
        fail_disable: HashSet<String>,
        fail_enable: HashSet<String>,
        /// Constraints whose child table holds rows without a parent.
        orphaned: HashSet<String>,
        disable_calls: usize,
        enable_calls: Vec<String>,
    }

    impl MemoryStore {
        fn with_keys(enabled: usize, disabled: usize) -> Self {
            let mut keys = Vec::new();
            for i in 0..enabled {
                keys.push(ForeignKeyState {
                    constraint: ConstraintRef::new("dbo", "Child", format!("FK_on_{}", i)),
                    is_disabled: false,
                });
            }
            for i in 0..disabled {
                keys.push(ForeignKeyState {
                    constraint: ConstraintRef::new("dbo", "Child", format!("FK_off_{}", i)),
                    is_disabled: true,
                });
            }
            MemoryStore {
                state: Snapshot { ledger: None, keys },
                ..Default::default()
            }
        }

        fn disabled_names(&self) -> HashSet<String> {
            self.state
                .keys
                .iter()
                .filter(|k| k.is_disabled)
                .map(|k| k.constraint.name.clone())
                .collect()
        }

        fn set_disabled(&mut self, constraint: &ConstraintRef, disabled: bool) {
            for key in &mut self.state.keys {
                if &key.constraint == constraint {
                    key.is_disabled = disabled;
                }
            }
        }
    }

    #[async_trait]
    impl LedgerStore for MemoryStore {
        async fn ledger_exists(&mut self) -> Result<bool> {
            Ok(self.state.ledger.is_some())
        }

        async fn begin(&mut self) -> Result<()> {
            self.saved = Some(self.state.clone());
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            self.saved = None;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            if let Some(saved) = self.saved.take() {
                self.state = saved;
            }
            Ok(())
        }

        async fn create_ledger(&mut self) -> Result<()> {
            self.state.ledger = Some(Vec::new());
            Ok(())
        }

        async fn list_foreign_keys(&mut self) -> Result<Vec<ForeignKeyState>> {
            Ok(self.state.keys.clone())
        }

        async fn disable_constraint(&mut self, constraint: &ConstraintRef) -> Result<()> {
            if self.fail_disable.contains(&constraint.name) {
                return Err(MigrateError::Validation("lock timeout".into()));
            }
            self.disable_calls += 1;
            self.set_disabled(constraint, true);
            Ok(())
        }

        async fn record(&mut self, entry: &LedgerEntry) -> Result<()> {
            match self.state.ledger.as_mut() {
                Some(ledger) => {
                    ledger.push(entry.clone());
                    Ok(())
                }
                None => Err(MigrateError::Validation("no ledger table".into())),
            }
        }

        async fn read_entries(&mut self) -> Result<Vec<LedgerEntry>> {
            Ok(self.state.ledger.clone().unwrap_or_default())
        }

        async fn enable_constraint(&mut self, constraint: &ConstraintRef) -> Result<()> {
            self.enable_calls.push(constraint.name.clone());
            if self.fail_enable.contains(&constraint.name) {
                return Err(MigrateError::Validation("lock timeout".into()));
            }
            // Revalidating statements fail the way the server does on orphans.
            let sql = alter_constraint_sql(constraint, true)?;
            if sql.contains("WITH CHECK") && self.orphaned.contains(&constraint.name) {
                return Err(MigrateError::Validation("conflicted with the FOREIGN KEY constraint".into()));
            }
            self.set_disabled(constraint, false);
            Ok(())
        }

        async fn drop_ledger(&mut self) -> Result<()> {
            self.state.ledger = None;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_disable_is_idempotent_and_enable_restores_only_owned() {
        let (n, m) = (3, 2);
        let mut store = MemoryStore::with_keys(n, m);

        assert_eq!(ledger_state(&mut store).await.unwrap(), LedgerState::NoLedger);
        assert_eq!(disable_foreign_keys(&mut store).await.unwrap(), n);
        assert_eq!(store.disable_calls, n);
        assert_eq!(store.state.ledger.as_ref().unwrap().len(), n + m);
        assert_eq!(store.disabled_names().len(), n + m);

        // Simulated crash: no enable, disable again.
        let ledger_before = store.state.ledger.clone();
        assert_eq!(disable_foreign_keys(&mut store).await.unwrap(), 0);
        assert_eq!(store.disable_calls, n);
        assert_eq!(store.state.ledger, ledger_before);
        assert_eq!(
            ledger_state(&mut store).await.unwrap(),
            LedgerState::ConstraintsDisabled
        );

        assert_eq!(enable_foreign_keys(&mut store).await.unwrap(), n);
        assert_eq!(store.enable_calls.len(), n);
        assert!(store.state.ledger.is_none());

        let still_disabled = store.disabled_names();
        assert_eq!(still_disabled.len(), m);
        assert!(still_disabled.iter().all(|name| name.starts_with("FK_off_")));
    }

    #[tokio::test]
    async fn test_failed_disable_rolls_back_everything() {
        let mut store = MemoryStore::with_keys(3, 1);
        store.fail_disable.insert("FK_on_2".to_string());

        let err = disable_foreign_keys(&mut store).await.unwrap_err();
        match err {
            MigrateError::ConstraintOperationFailure { constraint, .. } => {
                assert_eq!(constraint, "dbo.Child.FK_on_2");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.state.ledger.is_none());
        assert_eq!(store.disabled_names().len(), 1);
    }

    #[tokio::test]
    async fn test_enable_failure_is_skipped_and_ledger_dropped() {
        let mut store = MemoryStore::with_keys(3, 0);
        disable_foreign_keys(&mut store).await.unwrap();
        store.fail_enable.insert("FK_on_1".to_string());

        assert_eq!(enable_foreign_keys(&mut store).await.unwrap(), 2);
        assert_eq!(store.enable_calls.len(), 3);
        assert!(store.state.ledger.is_none());
        assert_eq!(store.disabled_names(), HashSet::from(["FK_on_1".to_string()]));
    }

    #[tokio::test]
    async fn test_enable_after_partial_import_leaves_no_constraint_disabled() {
        let mut store = MemoryStore::with_keys(3, 1);
        disable_foreign_keys(&mut store).await.unwrap();
        // A failed parent batch left child rows pointing nowhere.
        store.orphaned.insert("FK_on_0".to_string());
        store.orphaned.insert("FK_on_2".to_string());

        assert_eq!(enable_foreign_keys(&mut store).await.unwrap(), 3);
        assert!(store.state.ledger.is_none());
        assert_eq!(store.disabled_names(), HashSet::from(["FK_off_0".to_string()]));

        // A rerun finds no ledger and nothing left to restore.
        assert_eq!(enable_foreign_keys(&mut store).await.unwrap(), 0);
        assert_eq!(store.enable_calls.len(), 3);
    }

    #[tokio::test]
    async fn test_enable_without_ledger_is_noop() {
        let mut store = MemoryStore::with_keys(2, 0);
        assert_eq!(enable_foreign_keys(&mut store).await.unwrap(), 0);
        assert!(store.enable_calls.is_empty());
    }

    #[test]
    fn test_alter_constraint_sql() {
        let fk = ConstraintRef::new("dbo", "Cipher", "FK_Cipher_User");
        assert_eq!(
            alter_constraint_sql(&fk, false).unwrap(),
            "ALTER TABLE [dbo].[Cipher] NOCHECK CONSTRAINT [FK_Cipher_User]"
        );
        assert_eq!(
            alter_constraint_sql(&fk, true).unwrap(),
            "ALTER TABLE [dbo].[Cipher] CHECK CONSTRAINT [FK_Cipher_User]"
        );

        let bad = ConstraintRef::new("dbo", "Cipher", "FK]; DROP TABLE x;--");
        assert!(matches!(
            alter_constraint_sql(&bad, false),
            Err(MigrateError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_create_ledger_sql() {
        let sql = create_ledger_sql().unwrap();
        assert!(sql.starts_with("CREATE TABLE [dbo].[_MigrationDisabledConstraint]"));
        assert!(sql.contains("PreExistingDisabled BIT NOT NULL"));
        assert!(sql.contains("DEFAULT SYSUTCDATETIME()"));
    }
}
