//! Engine configuration, loadable from TOML

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Failure to load or accept an [`EngineConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// File that was asked for
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// Not valid TOML, or wrong shape
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serializing back to TOML failed
    #[error("config cannot be rendered: {0}")]
    Render(#[from] toml::ser::Error),

    /// Parsed, but a value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where runs are persisted
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process map, lost on exit
    #[default]
    Memory,
    /// Single-file SQLite database at `path`
    Sqlite {
        /// Database file, created when missing
        path: PathBuf,
    },
}

/// Engine-wide knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Unresolved interruptions fail after this long; 0 disables the deadline
    pub approval_timeout_secs: u64,
    /// Per-step invocation limit for steps without their own timeout
    pub default_step_timeout_secs: Option<u64>,
    /// How often the approval watchdog sweeps
    pub watchdog_interval_secs: u64,
    /// Optimistic-concurrency retries before giving up with `Contention`
    pub update_attempts: u32,
    /// Policy for steps that declare none
    pub default_retry: RetryPolicy,
    /// Run persistence backend
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: 86_400,
            default_step_timeout_secs: None,
            watchdog_interval_secs: 60,
            update_attempts: 16,
            default_retry: RetryPolicy::default(),
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_attempts == 0 {
            return Err(ConfigError::Invalid("update_attempts must be at least 1".into()));
        }
        if self.watchdog_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog_interval_secs must be at least 1".into(),
            ));
        }
        if self.default_step_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "default_step_timeout_secs must be positive when set".into(),
            ));
        }
        self.default_retry
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("default_retry: {e}")))
    }

    /// Approval deadline, `None` when disabled
    #[must_use]
    pub fn approval_timeout(&self) -> Option<Duration> {
        (self.approval_timeout_secs > 0).then(|| Duration::from_secs(self.approval_timeout_secs))
    }

    /// Fallback per-step invocation limit
    #[must_use]
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_secs.map(Duration::from_secs)
    }

    /// Sweep interval, never zero
    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }

    /// `None` disables approval deadlines.
    #[must_use]
    pub fn with_approval_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.approval_timeout_secs = timeout.map_or(0, |t| t.as_secs().max(1));
        self
    }

    /// Set the fallback retry policy.
    #[must_use]
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Set the fallback step timeout in seconds.
    #[must_use]
    pub fn with_default_step_timeout(mut self, secs: u64) -> Self {
        self.default_step_timeout_secs = Some(secs);
        self
    }

    /// Set the optimistic-concurrency retry bound.
    #[must_use]
    pub fn with_update_attempts(mut self, attempts: u32) -> Self {
        self.update_attempts = attempts;
        self
    }

    /// Set the persistence backend.
    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.default_retry.max_retries, 2);
        assert_eq!(config.approval_timeout(), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
            approval_timeout_secs = 0
            update_attempts = 4

            [default_retry]
            max_retries = 5

            [store]
            backend = "sqlite"
            path = "/tmp/adflow.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.approval_timeout(), None);
        assert_eq!(config.update_attempts, 4);
        assert_eq!(config.default_retry.max_retries, 5);
        assert_eq!(config.default_retry.base_delay_ms, 500);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: "/tmp/adflow.db".into()
            }
        );
    }

    #[test]
    fn rendered_config_parses_back() {
        let config = EngineConfig::default().with_default_step_timeout(30);
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn zero_update_attempts_is_invalid() {
        let err = EngineConfig::from_toml_str("update_attempts = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adflow.toml");
        std::fs::write(&path, "watchdog_interval_secs = 5\n").unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().watchdog_interval_secs, 5);
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
