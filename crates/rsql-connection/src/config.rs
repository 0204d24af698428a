//! Client-side connection settings
//!
//! Loaded from TOML or built in code:
//!
//! ```toml
//! statement_timeout_ms = 30000
//!
//! [txn]
//! max_attempts = 10
//! backoff_initial_ms = 20
//! backoff_max_ms = 2000
//! backoff_multiplier = 2.0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::BackoffStrategy;

/// Errors from loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid connection config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl From<ConfigError> for rsql_core::SqlError {
    fn from(err: ConfigError) -> Self {
        rsql_core::SqlError::Configuration(err.to_string())
    }
}

/// Settings for one `Conn`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnConfig {
    /// Upper bound for each statement; unset means no bound
    pub statement_timeout_ms: Option<u64>,
    pub txn: TxnRetryConfig,
}

impl ConnConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_txn(mut self, txn: TxnRetryConfig) -> Self {
        self.txn = txn;
        self
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Retry policy for `Conn::exec_txn`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnRetryConfig {
    /// Total attempts before giving up; unset retries until success
    pub max_attempts: Option<u32>,
    /// First delay between attempts; 0 retries immediately
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for TxnRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_initial_ms: 0,
            backoff_max_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl TxnRetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_backoff(mut self, backoff: &BackoffStrategy) -> Self {
        self.backoff_initial_ms = backoff.initial_delay().as_millis() as u64;
        self.backoff_max_ms = backoff.max_delay().as_millis() as u64;
        self.backoff_multiplier = backoff.multiplier();
        self
    }

    /// Backoff between attempts, `None` when attempts run back to back
    pub fn backoff(&self) -> Option<BackoffStrategy> {
        if self.backoff_initial_ms == 0 {
            return None;
        }
        Some(
            BackoffStrategy::new(
                Duration::from_millis(self.backoff_initial_ms),
                Duration::from_millis(self.backoff_max_ms),
            )
            .with_multiplier(self.backoff_multiplier),
        )
    }

    /// Whether attempt number `attempt` (1-based) may start
    pub(crate) fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ConnConfig::default();
        assert_eq!(config.statement_timeout(), None);
        assert_eq!(config.txn.max_attempts, None);
        assert!(config.txn.backoff().is_none());
        assert!(config.txn.allows(1_000_000));
    }

    #[test]
    fn test_from_toml() {
        let config = ConnConfig::from_toml_str(
            r#"
            statement_timeout_ms = 1500

            [txn]
            max_attempts = 4
            backoff_initial_ms = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.statement_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.txn.max_attempts, Some(4));
        assert!(config.txn.allows(4));
        assert!(!config.txn.allows(5));

        let backoff = config.txn.backoff().unwrap();
        assert_eq!(backoff.initial_delay(), Duration::from_millis(10));
        assert_eq!(backoff.max_delay(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(ConnConfig::from_toml_str("").unwrap(), ConnConfig::default());
    }

    #[test]
    fn test_invalid_toml() {
        let err = ConnConfig::from_toml_str("statement_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[txn]\nmax_attempts = 2").unwrap();

        let config = ConnConfig::load(file.path()).unwrap();
        assert_eq!(config.txn.max_attempts, Some(2));

        let err = ConnConfig::load("/nonexistent/rsql.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_builders() {
        let backoff = BackoffStrategy::new(Duration::from_millis(5), Duration::from_millis(80));
        let config = ConnConfig::default()
            .with_statement_timeout(Duration::from_secs(2))
            .with_txn(
                TxnRetryConfig::default()
                    .with_max_attempts(0)
                    .with_backoff(&backoff),
            );

        assert_eq!(config.statement_timeout_ms, Some(2000));
        assert_eq!(config.txn.max_attempts, Some(1));
        assert_eq!(config.txn.backoff(), Some(backoff));
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let config = ConnConfig {
            statement_timeout_ms: Some(0),
            ..Default::default()
        };
        assert_eq!(config.statement_timeout(), None);
    }
}
