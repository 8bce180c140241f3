use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{validate_unit_interval, ColonyError};

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_DECAY_RATE: f64 = 0.1;
const EVENT_LOG_FILE: &str = "events.jsonl";
const DATABASE_FILE: &str = "colony.sqlite3";

/// Runtime configuration handed to every component at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColonyConfig {
    pub base_dir: PathBuf,
    pub event_log_path: PathBuf,
    pub database_path: PathBuf,
    pub busy_timeout_ms: u64,
    /// Successful guarded writes between automatic consistency checks; 0 disables.
    pub validation_interval: u64,
    pub log_divergence: bool,
    pub fsync_appends: bool,
    pub default_decay_rate: f64,
}

/// On-disk shape. Omitted paths are derived from `base_dir`, relative paths
/// are resolved against it.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    base_dir: Option<PathBuf>,
    event_log_path: Option<PathBuf>,
    database_path: Option<PathBuf>,
    busy_timeout_ms: Option<u64>,
    validation_interval: Option<u64>,
    log_divergence: Option<bool>,
    fsync_appends: Option<bool>,
    default_decay_rate: Option<f64>,
}

impl ColonyConfig {
    #[must_use]
    pub fn for_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            event_log_path: base_dir.join(EVENT_LOG_FILE),
            database_path: base_dir.join(DATABASE_FILE),
            base_dir,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            validation_interval: 0,
            log_divergence: true,
            fsync_appends: false,
            default_decay_rate: DEFAULT_DECAY_RATE,
        }
    }

    /// Parse YAML configuration. `fallback_base_dir` applies when the document
    /// has no `base_dir` of its own.
    ///
    /// # Errors
    /// Returns [`ColonyError::Validation`] on malformed YAML or out-of-range values.
    pub fn from_yaml_str(yaml: &str, fallback_base_dir: &Path) -> Result<Self, ColonyError> {
        let file: ConfigFile = if yaml.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str(yaml)
                .map_err(|err| ColonyError::Validation(format!("invalid config YAML: {err}")))?
        };

        let base_dir = file
            .base_dir
            .unwrap_or_else(|| fallback_base_dir.to_path_buf());
        let mut config = Self::for_base_dir(base_dir);
        if let Some(path) = file.event_log_path {
            config.event_log_path = config.base_dir.join(path);
        }
        if let Some(path) = file.database_path {
            config.database_path = config.base_dir.join(path);
        }
        if let Some(value) = file.busy_timeout_ms {
            config.busy_timeout_ms = value;
        }
        if let Some(value) = file.validation_interval {
            config.validation_interval = value;
        }
        if let Some(value) = file.log_divergence {
            config.log_divergence = value;
        }
        if let Some(value) = file.fsync_appends {
            config.fsync_appends = value;
        }
        if let Some(value) = file.default_decay_rate {
            config.default_decay_rate = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let fallback = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Self::from_yaml_str(&content, fallback)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ColonyError::Validation`] for a decay rate outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ColonyError> {
        validate_unit_interval("default_decay_rate", self.default_decay_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::ColonyConfig;
    use std::path::Path;

    #[test]
    fn paths_derive_from_base_dir() {
        let config = ColonyConfig::for_base_dir("/tmp/colony");
        assert_eq!(config.event_log_path, Path::new("/tmp/colony/events.jsonl"));
        assert_eq!(config.database_path, Path::new("/tmp/colony/colony.sqlite3"));
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert_eq!(config.validation_interval, 0);
        assert!(config.log_divergence);
    }

    #[test]
    fn yaml_overrides_and_resolves_relative_paths() {
        let yaml = "
base_dir: /srv/colony
event_log_path: logs/events.jsonl
validation_interval: 10
fsync_appends: true
";
        let config = ColonyConfig::from_yaml_str(yaml, Path::new("/unused"))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(
            config.event_log_path,
            Path::new("/srv/colony/logs/events.jsonl")
        );
        assert_eq!(config.database_path, Path::new("/srv/colony/colony.sqlite3"));
        assert_eq!(config.validation_interval, 10);
        assert!(config.fsync_appends);
    }

    #[test]
    fn empty_yaml_uses_fallback_dir() {
        let config =
            ColonyConfig::from_yaml_str("", Path::new("/data")).unwrap_or_else(|_| unreachable!());
        assert_eq!(config.base_dir, Path::new("/data"));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_decay() {
        assert!(ColonyConfig::from_yaml_str("bogus: 1", Path::new("/d")).is_err());
        assert!(ColonyConfig::from_yaml_str("default_decay_rate: 2.0", Path::new("/d")).is_err());
    }
}
