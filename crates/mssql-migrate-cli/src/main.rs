//! mssql-migrate CLI - SQL Server to PostgreSQL / MySQL / SQLite / SQL Server migration.
//!
//! `run` copies tables directly. `export` and `import` split the same
//! migration in two through a directory of CSV files.

use clap::{Parser, Subcommand};
use mssql_migrate::{
    Config, MigrateError, MigrationResult, Migrator, RunStatus, TargetKind, VerifyStatus,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-migrate")]
#[command(about = "Migrate a SQL Server database to PostgreSQL, MySQL/MariaDB, SQLite or SQL Server")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate every selected table
    Run {
        /// Override the target engine (postgres, mariadb, sqlite, sqlserver)
        #[arg(long)]
        target_type: Option<String>,

        /// Override rows per transactional batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Use batched INSERT statements even when a bulk loader exists
        #[arg(long)]
        no_bulk: bool,

        /// Drop target tables before creating them
        #[arg(long)]
        drop_existing: bool,
    },

    /// Test database connections
    HealthCheck,

    /// List the source tables that would be migrated
    Tables,

    /// Compare source and target row counts
    Verify,

    /// Export every selected source table to CSV files
    Export {
        /// Override the staging directory (csv.output_dir)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Load a CSV staging directory into the target
    Import {
        /// Override the staging directory (csv.output_dir)
        #[arg(long)]
        input_dir: Option<PathBuf>,

        /// Override the target engine (postgres, mariadb, sqlite, sqlserver)
        #[arg(long)]
        target_type: Option<String>,

        /// Override rows per transactional batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Use batched INSERT statements even when a bulk loader exists
        #[arg(long)]
        no_bulk: bool,

        /// Drop target tables before creating them
        #[arg(long)]
        drop_existing: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            target_type,
            batch_size,
            no_bulk,
            drop_existing,
        } => {
            apply_overrides(&mut config, target_type, batch_size, no_bulk, drop_existing)?;

            let cancel_token = setup_signal_handler();
            let mut migrator = Migrator::new(config);
            let result = migrator.run(cancel_token).await?;
            report_migration(&result, cli.output_json)
        }

        Commands::HealthCheck => {
            let kind = config.target.kind;
            let mut migrator = Migrator::new(config);
            migrator.health_check().await?;

            if cli.output_json {
                let body = serde_json::json!({ "source": "ok", "target": "ok", "target_type": kind });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!("Health Check Results:");
                println!("  Source (SQL Server): OK");
                println!("  Target ({}): OK", kind);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Tables => {
            let mut migrator = Migrator::new(config);
            let tables = migrator.list_tables().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&tables)?);
            } else {
                for table in &tables {
                    println!("{}", table);
                }
                println!("\n{} tables", tables.len());
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Verify => {
            let mut migrator = Migrator::new(config);
            let results = migrator.verify().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("Verification Results:");
                for v in &results {
                    let mark = match v.status {
                        VerifyStatus::Verified => "OK",
                        VerifyStatus::Mismatch => "MISMATCH",
                        VerifyStatus::Missing => "MISSING",
                    };
                    let target = v
                        .target_rows
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("  {:<8} {} (source {}, target {})", mark, v.table, v.source_rows, target);
                }
            }

            let all_verified = results.iter().all(|v| v.status == VerifyStatus::Verified);
            Ok(if all_verified {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Export { output_dir } => {
            if let Some(dir) = output_dir {
                config.csv.output_dir = dir;
            }
            config.validate()?;

            let cancel_token = setup_signal_handler();
            let mut migrator = Migrator::new(config);
            let result = migrator.export_to_csv(cancel_token).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nExport {}!", result.status);
                println!("  Run ID: {}", result.run_id);
                println!("  Directory: {}", result.output_dir);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Tables: {}/{}", result.tables_success, result.tables_total);
                if result.tables_skipped > 0 {
                    println!("  Skipped: {}", result.tables_skipped);
                }
                println!("  Rows: {}", result.rows_exported);
                let failed = result.failed_tables();
                if !failed.is_empty() {
                    println!("  Failed tables: {:?}", failed);
                }
            }

            Ok(exit_code_for(result.status))
        }

        Commands::Import {
            input_dir,
            target_type,
            batch_size,
            no_bulk,
            drop_existing,
        } => {
            if let Some(dir) = input_dir {
                config.csv.output_dir = dir;
            }
            apply_overrides(&mut config, target_type, batch_size, no_bulk, drop_existing)?;

            let cancel_token = setup_signal_handler();
            let mut migrator = Migrator::new(config);
            let result = migrator.import_from_csv(cancel_token).await?;
            report_migration(&result, cli.output_json)
        }
    }
}

/// Apply the `run`/`import` flags on top of the loaded file.
fn apply_overrides(
    config: &mut Config,
    target_type: Option<String>,
    batch_size: Option<usize>,
    no_bulk: bool,
    drop_existing: bool,
) -> Result<(), MigrateError> {
    if let Some(kind) = target_type {
        config.target.kind = kind.parse::<TargetKind>()?;
    }
    if let Some(size) = batch_size {
        config.migration.batch_size = size;
    }
    if no_bulk {
        config.migration.use_bulk = false;
    }
    if drop_existing {
        config.migration.drop_existing = true;
    }
    config.validate()
}

fn report_migration(result: &MigrationResult, output_json: bool) -> Result<ExitCode, MigrateError> {
    if output_json {
        println!("{}", result.to_json()?);
    } else {
        println!("\nMigration {}!", result.status);
        println!("  Run ID: {}", result.run_id);
        println!("  Target: {}", result.target);
        println!("  Duration: {:.2}s", result.duration_seconds);
        println!("  Tables: {}/{}", result.tables_success, result.tables_total);
        if result.tables_skipped > 0 {
            println!("  Skipped: {}", result.tables_skipped);
        }
        println!("  Rows: {}", result.rows_imported);
        let failed = result.failed_tables();
        if !failed.is_empty() {
            println!("  Failed tables: {:?}", failed);
        }
        for v in &result.verification {
            if v.status != VerifyStatus::Verified {
                println!(
                    "  Verification {:?}: {} (source {}, target {:?})",
                    v.status, v.table, v.source_rows, v.target_rows
                );
            }
        }
    }

    Ok(exit_code_for(result.status))
}

fn exit_code_for(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::CompletedWithErrors => ExitCode::FAILURE,
        RunStatus::Cancelled => ExitCode::from(MigrateError::Cancelled.exit_code()),
    }
}

/// Logs go to stderr so `--output-json` leaves stdout parseable.
/// `RUST_LOG` takes precedence over `--verbosity`.
fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        other => return Err(format!("Invalid verbosity '{}'", other)),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("Invalid log format '{}'. Use text or json", other)),
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM; the run stops before the next
/// table once either arrives.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("Failed to install {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!("\nReceived {}. Finishing the current table before stopping...", name);
            token.cancel();
        });
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Failed to install Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Finishing the current table before stopping...");
        token.cancel();
    });

    cancel_token
}
