use std::{fs::File, io::BufReader, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eval::context::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_DEPTH};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to open config file {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Deployment name matched against registration environment filters.
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            event_buffer_size: default_event_buffer_size(),
            evaluation: EvaluationConfig::default(),
            dispatch: DispatchConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.is_empty() {
            return Err(ConfigError::Invalid("environment must not be empty".into()));
        }
        if self.dispatch.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("dispatch.worker_pool_size must be positive".into()));
        }
        if self.evaluation.max_depth == 0 {
            return Err(ConfigError::Invalid("evaluation.max_depth must be positive".into()));
        }
        if self.scheduler.lock_refresh_interval >= self.scheduler.lock_ttl {
            return Err(ConfigError::Invalid(
                "scheduler.lock_refresh_interval must be shorter than scheduler.lock_ttl".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_expression_depth")]
    pub max_depth: usize,

    #[serde(default = "default_cursor_batch_size")]
    pub cursor_batch_size: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_depth: default_expression_depth(),
            cursor_batch_size: default_cursor_batch_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Hard ceiling on nested firing depth. Unlimited when absent.
    #[serde(default)]
    pub max_depth: Option<usize>,

    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_depth: None,
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_lock_ttl", with = "duration_ms")]
    pub lock_ttl: Duration,

    #[serde(default = "default_lock_refresh_interval", with = "duration_ms")]
    pub lock_refresh_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            lock_ttl: default_lock_ttl(),
            lock_refresh_interval: default_lock_refresh_interval(),
        }
    }
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_event_buffer_size() -> usize {
    256
}

fn default_expression_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_cursor_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_worker_pool_size() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_lock_ttl() -> Duration {
    Duration::from_millis(300_000)
}

fn default_lock_refresh_interval() -> Duration {
    Duration::from_millis(60_000)
}

pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_round_trip() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = RuntimeConfig::from_str(&json).unwrap();
        assert_eq!(config, parsed);
        assert_eq!(parsed.scheduler.lock_ttl, Duration::from_secs(300));
        assert_eq!(parsed.dispatch.max_depth, None);
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "environment": "development", "dispatch": {{ "max_depth": 8 }}, "scheduler": {{ "lock_ttl": 5000, "lock_refresh_interval": 1000 }} }}"#
        )
        .unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.environment, "development");
        assert_eq!(config.dispatch.max_depth, Some(8));
        assert_eq!(config.dispatch.worker_pool_size, 16);
        assert_eq!(config.scheduler.lock_ttl, Duration::from_millis(5000));
        assert_eq!(config.evaluation.max_depth, 100);
    }

    #[test]
    fn test_invalid_values() {
        let err = RuntimeConfig::from_str(r#"{ "dispatch": { "worker_pool_size": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = RuntimeConfig::from_file("/nonexistent/keiro.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
