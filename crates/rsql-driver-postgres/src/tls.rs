//! TLS settings derived from the connection URL
//!
//! The `sslmode` and `sslrootcert` URL parameters follow libpq naming.

use native_tls::{Certificate, TlsConnector, TlsConnectorBuilder};
use postgres_native_tls::MakeTlsConnector;
use rsql_core::Endpoint;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio_postgres::config::SslMode;
use tracing::debug;

/// Error types for TLS setup
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("unknown sslmode {0:?}")]
    UnknownMode(String),

    #[error("failed to load CA certificate from {path}: {source}")]
    CaCertLoadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid CA certificate: {0}")]
    InvalidCaCert(String),

    #[error("TLS configuration error: {0}")]
    ConfigurationError(String),
}

/// libpq-style `sslmode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl TlsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Disable => "disable",
            TlsMode::Allow => "allow",
            TlsMode::Prefer => "prefer",
            TlsMode::Require => "require",
            TlsMode::VerifyCa => "verify-ca",
            TlsMode::VerifyFull => "verify-full",
        }
    }

    /// The closest mode tokio-postgres negotiates with
    pub(crate) fn ssl_mode(&self) -> SslMode {
        match self {
            TlsMode::Disable => SslMode::Disable,
            TlsMode::Allow | TlsMode::Prefer => SslMode::Prefer,
            TlsMode::Require | TlsMode::VerifyCa | TlsMode::VerifyFull => SslMode::Require,
        }
    }
}

impl FromStr for TlsMode {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "disable" => Ok(TlsMode::Disable),
            "allow" => Ok(TlsMode::Allow),
            "prefer" => Ok(TlsMode::Prefer),
            "require" => Ok(TlsMode::Require),
            "verify-ca" => Ok(TlsMode::VerifyCa),
            "verify-full" => Ok(TlsMode::VerifyFull),
            _ => Err(TlsError::UnknownMode(s.to_string())),
        }
    }
}

/// TLS settings for one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub mode: TlsMode,
    pub root_cert: Option<PathBuf>,
}

impl TlsSettings {
    pub fn from_endpoint(endpoint: &Endpoint) -> Result<Self, TlsError> {
        let mode = match endpoint.param("sslmode") {
            Some(raw) => raw.parse()?,
            None => TlsMode::default(),
        };
        let root_cert = endpoint
            .param("sslrootcert")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        Ok(Self { mode, root_cert })
    }

    /// Build the connector for TLS-capable modes, `None` when TLS is disabled
    pub fn connector(&self) -> Result<Option<MakeTlsConnector>, TlsError> {
        if self.mode == TlsMode::Disable {
            return Ok(None);
        }

        let mut builder = TlsConnector::builder();
        self.configure_verification(&mut builder);
        if let Some(path) = &self.root_cert {
            apply_ca_cert(&mut builder, path)?;
        }

        let connector = builder
            .build()
            .map_err(|e| TlsError::ConfigurationError(e.to_string()))?;
        Ok(Some(MakeTlsConnector::new(connector)))
    }

    fn configure_verification(&self, builder: &mut TlsConnectorBuilder) {
        match self.mode {
            TlsMode::Disable | TlsMode::VerifyFull => {}
            // Encryption only, as libpq does without a root certificate
            TlsMode::Allow | TlsMode::Prefer | TlsMode::Require => {
                if self.root_cert.is_none() {
                    builder.danger_accept_invalid_certs(true);
                }
                builder.danger_accept_invalid_hostnames(true);
            }
            TlsMode::VerifyCa => {
                builder.danger_accept_invalid_hostnames(true);
            }
        }
    }
}

fn apply_ca_cert(builder: &mut TlsConnectorBuilder, path: &Path) -> Result<(), TlsError> {
    debug!(path = %path.display(), "loading CA certificate");

    let pem = fs::read(path).map_err(|source| TlsError::CaCertLoadFailed {
        path: path.display().to_string(),
        source,
    })?;
    let cert = Certificate::from_pem(&pem).map_err(|e| TlsError::InvalidCaCert(e.to_string()))?;
    builder.add_root_certificate(cert);
    Ok(())
}
