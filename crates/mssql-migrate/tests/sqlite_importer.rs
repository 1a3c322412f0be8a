//! End-to-end tests of the SQLite importer against a temporary database file.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use mssql_migrate::core::schema::SourceColumn;
use mssql_migrate::drivers::mssql::canonicalize_guid_columns;
use mssql_migrate::{
    DatabaseConfig, Importer, MigrateError, Row, SqlNullType, SqlValue, SqliteImporter, TableInfo,
};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use tracing_subscriber::fmt::MakeWriter;
use uuid::Uuid;

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn importer_for(path: &Path) -> SqliteImporter {
    SqliteImporter::new(DatabaseConfig {
        database: path.to_string_lossy().into_owned(),
        ..Default::default()
    })
}

fn column(name: &str, data_type: &str, nullable: bool, ordinal: i32) -> SourceColumn {
    SourceColumn {
        name: name.to_string(),
        data_type: data_type.to_string(),
        max_length: if data_type.contains("char") { Some(100) } else { None },
        precision: None,
        scale: None,
        is_nullable: nullable,
        ordinal_pos: ordinal,
    }
}

fn users_table() -> TableInfo {
    TableInfo::from_columns(
        "Users",
        vec![
            column("Id", "int", false, 1),
            column("Email", "nvarchar", false, 2),
            column("Active", "bit", true, 3),
        ],
        0,
    )
}

fn user_row(id: i32, email: Option<&str>) -> Vec<SqlValue<'static>> {
    vec![
        SqlValue::I32(id),
        match email {
            Some(e) => SqlValue::from(e.to_string()),
            None => SqlValue::Null(SqlNullType::String),
        },
        SqlValue::Bool(id % 2 == 0),
    ]
}

fn user_columns() -> Vec<String> {
    vec!["Id".to_string(), "Email".to_string(), "Active".to_string()]
}

#[tokio::test]
async fn test_failing_batch_keeps_earlier_batches() {
    let dir = tempfile::tempdir().unwrap();
    let mut importer = importer_for(&dir.path().join("target.db"));
    importer.connect().await.unwrap();
    importer
        .create_table_from_schema(&users_table(), &HashSet::new())
        .await
        .unwrap();

    // Row 2200 violates NOT NULL on Email; the two full batches before it commit.
    let rows: Vec<_> = (0..2500)
        .map(|i| {
            let email = format!("user{}@example.com", i);
            user_row(i, if i == 2200 { None } else { Some(email.as_str()) })
        })
        .collect();

    let err = importer
        .import_rows("Users", &user_columns(), &rows, 1000)
        .await
        .unwrap_err();
    match err {
        MigrateError::BatchImportFailure { table, offset, rows, .. } => {
            assert_eq!(table, "Users");
            assert_eq!(offset, 2000);
            assert_eq!(rows, 500);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(importer.row_count("Users").await.unwrap(), 2000);

    importer.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_source_columns_missing_on_target_are_skipped() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = tempfile::tempdir().unwrap();
    let mut importer = importer_for(&dir.path().join("target.db"));
    importer.connect().await.unwrap();
    importer
        .create_table_from_schema(&users_table(), &HashSet::new())
        .await
        .unwrap();

    let columns = vec![
        "Id".to_string(),
        "Legacy".to_string(),
        "Email".to_string(),
    ];
    let rows = vec![
        vec![
            SqlValue::I32(1),
            SqlValue::from("ignored".to_string()),
            SqlValue::from("a@example.com".to_string()),
        ],
        vec![
            SqlValue::I32(2),
            SqlValue::from("ignored".to_string()),
            SqlValue::from("b@example.com".to_string()),
        ],
    ];

    let written = importer.import_rows("users", &columns, &rows, 100).await.unwrap();
    assert_eq!(written, 2);
    assert_eq!(importer.row_count("Users").await.unwrap(), 2);
    assert_eq!(
        importer.get_columns("USERS").await.unwrap(),
        vec!["Id", "Email", "Active"]
    );

    let warnings: Vec<String> = logs
        .contents()
        .lines()
        .filter(|l| l.contains("WARN") && l.contains("skipping source columns"))
        .map(str::to_string)
        .collect();
    assert_eq!(warnings.len(), 1, "{:?}", warnings);
    assert!(warnings[0].contains("users"));
    assert!(warnings[0].ends_with("Legacy"));

    let none_match = vec!["Nope".to_string()];
    let err = importer
        .import_rows("Users", &none_match, &[vec![SqlValue::I32(1)]], 100)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::Validation(_)));
}

#[tokio::test]
async fn test_unsafe_identifiers_are_rejected_before_any_statement() {
    let dir = tempfile::tempdir().unwrap();
    let mut importer = importer_for(&dir.path().join("target.db"));
    importer.connect().await.unwrap();

    let bad_table = TableInfo::from_columns(
        "Users; DROP TABLE x",
        vec![column("Id", "int", false, 1)],
        0,
    );
    let err = importer
        .create_table_from_schema(&bad_table, &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::InvalidIdentifier { .. }));

    let bad_column = TableInfo::from_columns("Safe", vec![column("Id\"--", "int", false, 1)], 0);
    let err = importer
        .create_table_from_schema(&bad_column, &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::InvalidIdentifier { .. }));
    assert!(!importer.table_exists("Safe").await.unwrap());

    let err = importer
        .import_rows("Users", &["Id)".to_string()], &[], 10)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::InvalidIdentifier { .. }));
}

#[tokio::test]
async fn test_missing_table_is_reported_and_drop_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let mut importer = importer_for(&dir.path().join("nested/dir/target.db"));
    importer.connect().await.unwrap();

    assert!(!importer.table_exists("Ghost").await.unwrap());
    importer.drop_table("Ghost").await.unwrap();

    let err = importer.row_count("Ghost").await.unwrap_err();
    assert!(matches!(err, MigrateError::TableNotFound(ref t) if t == "Ghost"));

    let err = importer
        .import_rows("Ghost", &user_columns(), &[user_row(1, Some("x"))], 10)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::TableNotFound(_)));

    importer
        .create_table_from_schema(&users_table(), &HashSet::new())
        .await
        .unwrap();
    importer.drop_table("Users").await.unwrap();
    assert!(!importer.table_exists("Users").await.unwrap());
}

#[tokio::test]
async fn test_foreign_keys_can_be_suspended_for_out_of_order_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target.db");

    {
        let mut setup = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .connect()
            .await
            .unwrap();
        sqlx::query("CREATE TABLE Parent (Id INTEGER PRIMARY KEY)")
            .execute(&mut setup)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE Child (Id INTEGER PRIMARY KEY, ParentId INTEGER REFERENCES Parent(Id))",
        )
        .execute(&mut setup)
        .await
        .unwrap();
        setup.close().await.unwrap();
    }

    let mut importer = importer_for(&path);
    importer.connect().await.unwrap();
    let columns = vec!["Id".to_string(), "ParentId".to_string()];

    // Enforcement is on by default.
    let err = importer
        .import_rows("Child", &columns, &[vec![SqlValue::I64(1), SqlValue::I64(42)]], 10)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::BatchImportFailure { .. }));

    importer.disable_foreign_keys().await.unwrap();
    let written = importer
        .import_rows("Child", &columns, &[vec![SqlValue::I64(1), SqlValue::I64(42)]], 10)
        .await
        .unwrap();
    assert_eq!(written, 1);
    importer
        .import_rows("Parent", &["Id".to_string()], &[vec![SqlValue::I64(42)]], 10)
        .await
        .unwrap();
    importer.enable_foreign_keys().await.unwrap();

    let err = importer
        .import_rows("Child", &columns, &[vec![SqlValue::I64(2), SqlValue::I64(7)]], 10)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::BatchImportFailure { .. }));
    assert_eq!(importer.row_count("Child").await.unwrap(), 1);

    importer.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_connect_and_disconnect_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target.db");
    let mut importer = importer_for(&path);

    importer.test_connection().await.unwrap();
    assert!(!importer.is_connected());

    importer.disconnect().await.unwrap();
    importer.connect().await.unwrap();
    importer.connect().await.unwrap();
    assert!(importer.is_connected());

    importer
        .create_table_from_schema(&users_table(), &HashSet::new())
        .await
        .unwrap();
    // Creating again leaves the existing table alone.
    importer
        .create_table_from_schema(&users_table(), &HashSet::new())
        .await
        .unwrap();

    importer.disconnect().await.unwrap();
    importer.disconnect().await.unwrap();
    assert!(!importer.is_connected());

    let err = importer.table_exists("Users").await.unwrap_err();
    assert!(matches!(err, MigrateError::NotConnected(_)));

    // The data survives reopening the file.
    importer.connect().await.unwrap();
    assert!(importer.table_exists("Users").await.unwrap());
    importer.disconnect().await.unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn test_canonicalized_guids_survive_import() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target.db");
    let mut importer = importer_for(&path);
    importer.connect().await.unwrap();

    let device = TableInfo::from_columns(
        "Device",
        vec![
            column("Id", "uniqueidentifier", false, 1),
            column("UserId", "uniqueidentifier", true, 2),
            column("Name", "nvarchar", false, 3),
        ],
        0,
    );
    importer
        .create_table_from_schema(&device, &HashSet::new())
        .await
        .unwrap();

    let ids = [
        "0f8fad5b-d9cb-469f-a165-70867728950e",
        "7c9e6679-7425-40de-944b-e07fc1f90ae7",
    ];
    let owner = "a1b2c3d4-e5f6-4789-abcd-ef0123456789";
    let mut rows: Vec<Row> = vec![
        vec![
            SqlValue::Uuid(Uuid::parse_str(ids[0]).unwrap()),
            SqlValue::from(owner.to_string()),
            SqlValue::from("laptop".to_string()),
        ],
        vec![
            SqlValue::Uuid(Uuid::parse_str(ids[1]).unwrap()),
            SqlValue::Null(SqlNullType::String),
            SqlValue::from("phone".to_string()),
        ],
    ];
    canonicalize_guid_columns(&mut rows, &[0, 1]);
    assert_eq!(rows[0][1], SqlValue::from(owner.to_uppercase()));

    let columns = vec!["Id".to_string(), "UserId".to_string(), "Name".to_string()];
    let written = importer.import_rows("Device", &columns, &rows, 10).await.unwrap();
    assert_eq!(written, 2);
    importer.disconnect().await.unwrap();

    let mut conn = SqliteConnectOptions::new()
        .filename(&path)
        .connect()
        .await
        .unwrap();
    let stored: Vec<(String, Option<String>)> =
        sqlx::query_as("SELECT \"Id\", \"UserId\" FROM \"Device\" ORDER BY \"Name\"")
            .fetch_all(&mut conn)
            .await
            .unwrap();
    conn.close().await.unwrap();

    assert_eq!(stored.len(), 2);
    assert!(stored[0].0.eq_ignore_ascii_case(ids[0]));
    assert!(stored[0].1.as_deref().unwrap().eq_ignore_ascii_case(owner));
    assert!(stored[1].0.eq_ignore_ascii_case(ids[1]));
    assert_eq!(stored[1].1, None);
    assert_eq!(
        Uuid::parse_str(&stored[1].0).unwrap(),
        Uuid::parse_str(ids[1]).unwrap()
    );
}
