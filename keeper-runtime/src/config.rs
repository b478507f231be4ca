//! Controller settings from a YAML file, `KEEPER_*` environment variables, or both.
//!
//! ```yaml
//! reconciler:
//!   finalizer: webapp.example.com/finalizer
//!   driftInterval: 5m
//!   retryInterval: 30s
//! controller:
//!   concurrency: 4
//!   conflictRetry: 1s
//!   minBackoff: 30s
//!   maxBackoff: 5m
//! ```
//!
//! Every field is optional. Environment variables win over the file.
use keeper_core::duration::{Duration, ParseError};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Environment variable naming a config file to load when no path is given
pub const KEEPER_CONFIG: &str = "KEEPER_CONFIG";

/// Errors loading a [`Config`]
#[derive(Error, Debug)]
pub enum Error {
    /// The config file could not be read
    #[error("failed to read config file {1:?}: {0}")]
    ReadConfig(#[source] std::io::Error, PathBuf),

    /// The config file is not valid YAML for a [`Config`]
    #[error("failed to parse config: {0}")]
    Parse(#[source] serde_yaml::Error),

    /// An environment override holds an invalid duration
    #[error("{0} is not a valid duration: {1}")]
    InvalidDuration(&'static str, #[source] ParseError),

    /// An environment override holds an invalid number
    #[error("{0} is not a valid number: {1}")]
    InvalidNumber(&'static str, #[source] std::num::ParseIntError),

    /// The finalizer name is empty or contains whitespace
    #[error("invalid finalizer name {0:?}")]
    InvalidFinalizer(String),

    /// A requeue interval is zero, which would reconcile in a busy loop
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Settings for a [`Reconciler`](crate::Reconciler)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerConfig {
    /// The finalizer marker this controller owns
    pub finalizer: String,
    /// Requeue delay after a successful reconcile, to catch drift
    pub drift_interval: Duration,
    /// Requeue delay after a transient failure reported by the hooks
    pub retry_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            finalizer: "keeper.dev/finalizer".into(),
            drift_interval: Duration::from_secs(5 * 60),
            retry_interval: Duration::from_secs(30),
        }
    }
}

impl ReconcilerConfig {
    /// Settings with a custom finalizer and default intervals
    #[must_use]
    pub fn with_finalizer(finalizer: impl Into<String>) -> Self {
        Self {
            finalizer: finalizer.into(),
            ..Self::default()
        }
    }
}

/// Settings for a [`Controller`](crate::Controller) and its error policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Maximum number of concurrent reconciles, `0` for unbounded
    pub concurrency: u16,
    /// Requeue delay after a write conflict
    pub conflict_retry: Duration,
    /// First delay of the per-object exponential backoff on errors
    pub min_backoff: Duration,
    /// Upper bound of the per-object exponential backoff on errors
    pub max_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            conflict_retry: Duration::from_secs(1),
            min_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(5 * 60),
        }
    }
}

/// Full runtime configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// See [`ReconcilerConfig`]
    pub reconciler: ReconcilerConfig,
    /// See [`ControllerConfig`]
    pub controller: ControllerConfig,
}

impl Config {
    /// Load from `path`, or from `$KEEPER_CONFIG`, or start from defaults; then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(KEEPER_CONFIG).map(PathBuf::from));
        let config = match path {
            Some(path) => Self::read_from(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Read a config file, without environment overrides
    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let data = fs::read_to_string(&path).map_err(|source| Error::ReadConfig(source, path.as_ref().into()))?;
        Self::from_yaml(&data)
    }

    /// Parse a config document
    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text).map_err(Error::Parse)?;
        config.validate()
    }

    /// Apply `KEEPER_*` overrides looked up through `lookup`
    ///
    /// Recognized keys: `KEEPER_FINALIZER`, `KEEPER_DRIFT_INTERVAL`, `KEEPER_RETRY_INTERVAL`,
    /// `KEEPER_CONCURRENCY`, `KEEPER_CONFLICT_RETRY`, `KEEPER_MIN_BACKOFF`, `KEEPER_MAX_BACKOFF`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let duration = |key: &'static str, target: &mut Duration| -> Result<(), Error> {
            if let Some(raw) = lookup(key) {
                *target = raw.trim().parse().map_err(|err| Error::InvalidDuration(key, err))?;
            }
            Ok(())
        };
        if let Some(finalizer) = lookup("KEEPER_FINALIZER") {
            self.reconciler.finalizer = finalizer;
        }
        duration("KEEPER_DRIFT_INTERVAL", &mut self.reconciler.drift_interval)?;
        duration("KEEPER_RETRY_INTERVAL", &mut self.reconciler.retry_interval)?;
        duration("KEEPER_CONFLICT_RETRY", &mut self.controller.conflict_retry)?;
        duration("KEEPER_MIN_BACKOFF", &mut self.controller.min_backoff)?;
        duration("KEEPER_MAX_BACKOFF", &mut self.controller.max_backoff)?;
        if let Some(raw) = lookup("KEEPER_CONCURRENCY") {
            self.controller.concurrency = raw
                .trim()
                .parse()
                .map_err(|err| Error::InvalidNumber("KEEPER_CONCURRENCY", err))?;
        }
        self.validate()
    }

    fn validate(self) -> Result<Self, Error> {
        let finalizer = &self.reconciler.finalizer;
        if finalizer.is_empty() || finalizer.chars().any(char::is_whitespace) {
            return Err(Error::InvalidFinalizer(finalizer.clone()));
        }
        if self.reconciler.drift_interval.as_std().is_zero() {
            return Err(Error::ZeroInterval("driftInterval"));
        }
        if self.reconciler.retry_interval.as_std().is_zero() {
            return Err(Error::ZeroInterval("retryInterval"));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ControllerConfig, Error, ReconcilerConfig};
    use keeper_core::duration::Duration;
    use std::{collections::HashMap, io::Write};

    #[test]
    fn defaults_match_documented_intervals() {
        let config = Config::default();
        assert_eq!(config.reconciler.drift_interval.as_std().as_secs(), 300);
        assert_eq!(config.reconciler.retry_interval.as_std().as_secs(), 30);
        assert_eq!(config.controller.conflict_retry.as_std().as_secs(), 1);
        assert_eq!(config.controller.max_backoff.as_std().as_secs(), 300);
        assert_eq!(config.controller.concurrency, 0);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            r#"
reconciler:
  finalizer: webapp.example.com/finalizer
  driftInterval: 1h30m
controller:
  concurrency: 4
"#,
        )
        .unwrap();
        assert_eq!(config.reconciler.finalizer, "webapp.example.com/finalizer");
        assert_eq!(config.reconciler.drift_interval.as_std().as_secs(), 90 * 60);
        assert_eq!(config.reconciler.retry_interval, ReconcilerConfig::default().retry_interval);
        assert_eq!(config.controller.concurrency, 4);
        assert_eq!(config.controller.max_backoff, ControllerConfig::default().max_backoff);
    }

    #[test]
    fn env_overrides_win_over_file() {
        let env = HashMap::from([
            ("KEEPER_DRIFT_INTERVAL", "10m"),
            ("KEEPER_CONCURRENCY", "2"),
            ("KEEPER_FINALIZER", "cache.example.com/finalizer"),
        ]);
        let config = Config::from_yaml("reconciler:\n  driftInterval: 1m\n")
            .unwrap()
            .with_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.reconciler.drift_interval, Duration::from_secs(600));
        assert_eq!(config.controller.concurrency, 2);
        assert_eq!(config.reconciler.finalizer, "cache.example.com/finalizer");
    }

    #[test]
    fn bad_values_are_reported() {
        let err = Config::default()
            .with_env_overrides(|k| (k == "KEEPER_MAX_BACKOFF").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDuration("KEEPER_MAX_BACKOFF", _)));

        let err = Config::from_yaml("reconciler:\n  finalizer: \"has space\"\n").unwrap_err();
        assert!(matches!(err, Error::InvalidFinalizer(_)));

        assert!(matches!(
            Config::from_yaml("controller: [1, 2]"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn zero_requeue_intervals_are_rejected() {
        let err = Config::from_yaml("reconciler:\n  driftInterval: 0s\n").unwrap_err();
        assert!(matches!(err, Error::ZeroInterval("driftInterval")));

        let err = Config::default()
            .with_env_overrides(|k| (k == "KEEPER_RETRY_INTERVAL").then(|| "0s".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::ZeroInterval("retryInterval")));
    }

    #[test]
    fn reads_config_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "controller:\n  maxBackoff: 2m").unwrap();
        let config = Config::read_from(file.path()).unwrap();
        assert_eq!(config.controller.max_backoff, Duration::from_secs(120));

        let missing = Config::read_from("/nonexistent/keeper.yaml").unwrap_err();
        assert!(matches!(missing, Error::ReadConfig(..)));
    }
}
