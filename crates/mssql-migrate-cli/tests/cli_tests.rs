//! CLI integration tests for mssql-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for various error conditions.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the mssql-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("mssql-migrate").unwrap()
}

/// Config with an unreachable SQL Server source and a SQLite target.
fn sqlite_config() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"source:
  host: 127.0.0.1
  port: 1
  database: Vault
  user: sa
  password: secret
target:
  type: sqlite
  database: target.db
"#
    )
    .unwrap();
    file
}

/// Config with an unreachable SQL Server source and a SQLite target file.
fn sqlite_config_at(db_path: &std::path::Path) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"source:
  host: 127.0.0.1
  port: 1
  database: Vault
  user: sa
target:
  type: sqlite
  database: "{}"
"#,
        db_path.display()
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("health-check"))
        .stdout(predicate::str::contains("tables"))
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("export"))
        .stdout(predicate::str::contains("import"));
}

#[test]
fn test_export_and_import_subcommand_help() {
    cmd()
        .args(["export", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-dir"));

    cmd()
        .args(["import", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--input-dir"))
        .stdout(predicate::str::contains("--target-type"))
        .stdout(predicate::str::contains("--drop-existing"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--target-type"))
        .stdout(predicate::str::contains("--batch-size"))
        .stdout(predicate::str::contains("--no-bulk"))
        .stdout(predicate::str::contains("--drop-existing"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mssql-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_and_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_is_io_error() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_required_fields_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source:").unwrap();
    writeln!(file, "  host: localhost").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2);
}

#[test]
fn test_unknown_target_type_exits_with_code_2() {
    let config = sqlite_config();

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "run",
            "--target-type",
            "oracle",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown target type"));
}

#[test]
fn test_zero_batch_size_exits_with_code_2() {
    let config = sqlite_config();

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "run",
            "--batch-size",
            "0",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("batch_size"));
}

#[test]
fn test_invalid_log_format_exits_with_code_2() {
    let config = sqlite_config();

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--log-format",
            "xml",
            "tables",
        ])
        .assert()
        .code(2);
}

#[test]
fn test_unreachable_source_exits_with_code_3() {
    let config = sqlite_config();

    cmd()
        .args(["--config", config.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("sqlserver"));
}

#[test]
fn test_export_with_unreachable_source_exits_with_code_3() {
    let staging = tempfile::tempdir().unwrap();
    let config = sqlite_config();

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "export",
            "--output-dir",
            staging.path().to_str().unwrap(),
        ])
        .assert()
        .code(3);
}

#[test]
fn test_import_missing_directory_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = sqlite_config_at(&dir.path().join("target.db"));

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "import",
            "--input-dir",
            dir.path().join("nope").to_str().unwrap(),
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("IO error"));
}

// =============================================================================
// CSV Import Tests
// =============================================================================

#[test]
fn test_import_loads_staged_csv_into_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let staging = dir.path().join("staging");
    std::fs::create_dir(&staging).unwrap();
    std::fs::write(
        staging.join("User.csv"),
        "\"Id\",\"Email\",\"Premium\"\n\"1\",\"a@example.com\",\"true\"\n\"2\",\"b@example.com\",\"\"\n",
    )
    .unwrap();
    let config = sqlite_config_at(&dir.path().join("target.db"));

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--output-json",
            "import",
            "--input-dir",
            staging.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"completed\""))
        .stdout(predicate::str::contains("\"rows_imported\": 2"))
        .stdout(predicate::str::contains("\"target\": \"sqlite\""));

    assert!(dir.path().join("target.db").exists());
}
