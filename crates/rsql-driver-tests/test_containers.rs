//! Docker container management for integration tests.
//!
//! Each test owns its `PostgresServer`: recovery tests stop, restart and
//! kill backends on it, which would break any other test sharing the same
//! server. The container is removed when the `PostgresServer` is dropped.
//!
//! # Usage
//!
//! ```rust,ignore
//! use crate::test_containers::PostgresServer;
//!
//! let server = PostgresServer::start().await?;
//! let endpoint = server.info().endpoint()?;
//! // Connect using the endpoint...
//! ```

use anyhow::Context;
use rsql_core::{Driver, Endpoint};
use rsql_driver_postgres::PostgresDriver;
use std::time::{Duration, Instant};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

const POSTGRES_PORT: u16 = 5432;
const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Information about a running test container
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Host address (typically 127.0.0.1)
    pub host: String,
    /// Port number (randomly assigned by testcontainers, changes on restart)
    pub port: u16,
    /// Database name
    pub database: String,
    /// Username for authentication
    pub username: String,
    /// Password for authentication
    pub password: String,
}

impl ContainerInfo {
    /// Connection URL for this container with the given `sslmode`
    pub fn url(&self, sslmode: &str) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}?sslmode={}",
            self.username, self.password, self.host, self.port, self.database, sslmode
        )
    }

    /// Plaintext endpoint for this container
    pub fn endpoint(&self) -> anyhow::Result<Endpoint> {
        self.endpoint_with_sslmode("disable")
    }

    /// Endpoint for this container with the given `sslmode`
    pub fn endpoint_with_sslmode(&self, sslmode: &str) -> anyhow::Result<Endpoint> {
        Endpoint::parse(&self.url(sslmode)).context("failed to parse container endpoint")
    }
}

/// A PostgreSQL container owned by one test
pub struct PostgresServer {
    inner: ContainerAsync<Postgres>,
    info: ContainerInfo,
}

impl PostgresServer {
    /// Start a fresh container and wait until it accepts queries
    pub async fn start() -> anyhow::Result<Self> {
        tracing::info!("starting PostgreSQL test container");

        let container = Postgres::default()
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start postgres container: {}", e))?;

        let port = mapped_port(&container).await?;

        // testcontainers-modules Postgres defaults: postgres user/password with "postgres" database
        let info = ContainerInfo {
            host: "127.0.0.1".to_string(),
            port,
            database: "postgres".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
        };

        wait_until_ready(&info).await?;
        tracing::info!(port, "PostgreSQL test container ready");

        Ok(Self {
            inner: container,
            info,
        })
    }

    /// Connection details as of the last (re)start
    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    /// Stop the server. Every open connection to it is severed.
    pub async fn stop(&self) -> anyhow::Result<()> {
        tracing::info!(port = self.info.port, "stopping PostgreSQL test container");
        self.inner
            .stop()
            .await
            .map_err(|e| anyhow::anyhow!("failed to stop postgres container: {}", e))
    }

    /// Start a stopped server again. Docker usually maps it to a new host
    /// port, so callers must re-read `info()` afterwards.
    pub async fn restart(&mut self) -> anyhow::Result<()> {
        self.inner
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to restart postgres container: {}", e))?;

        let previous = self.info.port;
        self.info.port = mapped_port(&self.inner).await?;
        wait_until_ready(&self.info).await?;
        tracing::info!(previous, port = self.info.port, "PostgreSQL test container restarted");
        Ok(())
    }
}

async fn mapped_port(container: &ContainerAsync<Postgres>) -> anyhow::Result<u16> {
    container
        .get_host_port_ipv4(POSTGRES_PORT)
        .await
        .map_err(|e| anyhow::anyhow!("failed to get postgres port: {}", e))
}

/// The image logs readiness before the server finishes its startup
/// restart, so poll with a real query until one succeeds.
async fn wait_until_ready(info: &ContainerInfo) -> anyhow::Result<()> {
    let endpoint = info.endpoint()?;
    let driver = PostgresDriver::new();
    let deadline = Instant::now() + READY_TIMEOUT;

    loop {
        let attempt = async {
            let conn = driver.connect(&endpoint).await?;
            conn.query("SELECT 1", &[]).await?;
            conn.close().await
        };
        match attempt.await {
            Ok(()) => return Ok(()),
            Err(e) if Instant::now() < deadline => {
                tracing::debug!(error = %e, "postgres not ready yet");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "postgres at port {} not ready after {:?}: {}",
                    info.port,
                    READY_TIMEOUT,
                    e
                ));
            }
        }
    }
}
