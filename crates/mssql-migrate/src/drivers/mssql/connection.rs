//! Tiberius connection factory shared by the SQL Server reader and importer.

use std::time::Duration;

use async_trait::async_trait;
use bb8::Pool;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::warn;

use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};

/// A connected SQL Server session.
pub type MssqlClient = Client<Compat<TcpStream>>;

/// Default SQL Server port.
pub const MSSQL_DEFAULT_PORT: u16 = 1433;

/// Default SQL Server schema.
pub const MSSQL_DEFAULT_SCHEMA: &str = "dbo";

/// Connection acquisition timeout. Bulk loads hold a session far longer than
/// this; it only bounds the login handshake.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP keepalive interval (30 seconds).
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connection manager for bb8 with Tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: DatabaseConfig,
}

impl TiberiusConnectionManager {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    /// `host:port/database`, for log records.
    pub fn describe(&self) -> String {
        format!(
            "{}:{}/{}",
            self.config.host,
            self.config.port_or(MSSQL_DEFAULT_PORT),
            self.config.database
        )
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port_or(MSSQL_DEFAULT_PORT));
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        if self.config.encrypt {
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }
        if self.config.trust_server_cert {
            config.trust_cert();
        }

        config
    }

    /// Build a single-connection pool. The reader reuses that one session
    /// for every query; the importer takes it out as a dedicated connection.
    pub async fn single_session_pool(self) -> Result<Pool<Self>> {
        let target = self.describe();
        Pool::builder()
            .max_size(1)
            .connection_timeout(CONNECTION_TIMEOUT)
            .test_on_check_out(true)
            .build(self)
            .await
            .map_err(|e| MigrateError::connection("sqlserver", format!("{}: {}", target, e)))
    }
}

fn io_error(e: std::io::Error, context: &str) -> tiberius::error::Error {
    tiberius::error::Error::Io {
        kind: e.kind(),
        message: format!("{}: {}", context, e),
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| io_error(e, "connect"))?;
        tcp.set_nodelay(true).ok();

        let std_tcp = tcp.into_std().map_err(|e| io_error(e, "socket"))?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on SQL Server connection: {}", e);
        }

        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).ok();
        let tcp = TcpStream::from_std(std_tcp).map_err(|e| io_error(e, "convert socket"))?;

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Run `SELECT 1` on a fresh connection and close it.
pub async fn check_connection(config: &DatabaseConfig) -> Result<()> {
    use bb8::ManageConnection;

    let manager = TiberiusConnectionManager::new(config.clone());
    let mut client = manager
        .connect()
        .await
        .map_err(|e| MigrateError::connection("sqlserver", e))?;
    client.simple_query("SELECT 1").await?.into_row().await?;
    client.close().await?;
    Ok(())
}

/// Run a batch of statements and discard any results.
pub async fn execute_batch(client: &mut MssqlClient, sql: &str) -> Result<()> {
    client.simple_query(sql).await?.into_results().await?;
    Ok(())
}

/// Run a query whose first column of the first row is an integer.
pub async fn query_scalar_i64(client: &mut MssqlClient, sql: &str) -> Result<i64> {
    let row = client.simple_query(sql).await?.into_row().await?;
    let value = match row {
        Some(row) => row
            .try_get::<i64, _>(0)
            .or_else(|_| row.try_get::<i32, _>(0).map(|v| v.map(i64::from)))?
            .unwrap_or(0),
        None => 0,
    };
    Ok(value)
}
