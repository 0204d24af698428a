//! PostgreSQL driver implementation

use async_trait::async_trait;
use rsql_core::{Driver, DriverConnection, Endpoint, Result, SqlError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{Client, Config, NoTls, Socket};

use crate::connection::PostgresConnection;
use crate::error::map_postgres_error;
use crate::tls::TlsSettings;

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_USER: &str = "root";

/// PostgreSQL-protocol database driver (PostgreSQL, CockroachDB)
#[derive(Debug, Clone)]
pub struct PostgresDriver {
    application_name: Option<String>,
}

impl PostgresDriver {
    /// Create a new PostgreSQL driver instance
    pub fn new() -> Self {
        tracing::debug!("PostgreSQL driver initialized");
        Self {
            application_name: None,
        }
    }

    /// Application name reported to the server unless the URL sets one
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Translate an endpoint into a tokio-postgres configuration
    pub fn config_for(&self, endpoint: &Endpoint, tls: &TlsSettings) -> Result<Config> {
        let mut config = Config::new();
        config
            .host(endpoint.host().unwrap_or("localhost"))
            .port(endpoint.port().unwrap_or(DEFAULT_PORT))
            .ssl_mode(tls.mode.ssl_mode());

        let user = match endpoint.user() {
            Some(user) => decode_component(user)?,
            None => DEFAULT_USER.to_string(),
        };
        config.user(&user);
        if let Some(password) = endpoint.password() {
            config.password(decode_component(password)?);
        }
        if let Some(database) = endpoint.database() {
            config.dbname(&decode_component(database)?);
        }

        let application_name = endpoint
            .param("application_name")
            .or_else(|| self.application_name.clone());
        if let Some(name) = application_name {
            config.application_name(&name);
        }
        if let Some(options) = endpoint.param("options") {
            config.options(&options);
        }
        if let Some(raw) = endpoint.param("connect_timeout") {
            let secs: u64 = raw.parse().map_err(|_| {
                SqlError::Configuration(format!("invalid connect_timeout {:?}", raw))
            })?;
            if secs > 0 {
                config.connect_timeout(Duration::from_secs(secs));
            }
        }

        Ok(config)
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_component(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| SqlError::Configuration(format!("invalid URL encoding: {}", e)))
}

/// Open the session and hand the connection future to the runtime
async fn connect_with<T>(config: &Config, tls: T) -> Result<(Client, JoinHandle<()>)>
where
    T: MakeTlsConnect<Socket> + Send,
    T::TlsConnect: Send,
    T::Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let (client, connection) = config.connect(tls).await.map_err(|e| {
        if e.as_db_error().is_some() {
            map_postgres_error(e)
        } else {
            SqlError::Connection(e.to_string())
        }
    })?;

    let task = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "PostgreSQL connection error");
        }
    });

    Ok((client, task))
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[tracing::instrument(skip(self, endpoint), fields(endpoint = %endpoint))]
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DriverConnection>> {
        let tls = TlsSettings::from_endpoint(endpoint)
            .map_err(|e| SqlError::Configuration(e.to_string()))?;
        let config = self.config_for(endpoint, &tls)?;

        tracing::info!(ssl_mode = tls.mode.as_str(), "connecting to PostgreSQL server");

        let connector = tls
            .connector()
            .map_err(|e| SqlError::Configuration(e.to_string()))?;
        let (client, task) = match &connector {
            Some(connector) => connect_with(&config, connector.clone()).await?,
            None => connect_with(&config, NoTls).await?,
        };

        tracing::info!("PostgreSQL connection established");
        Ok(Arc::new(PostgresConnection::new(client, task, connector)))
    }
}
