//! Runtime configuration.

use serde::{Deserialize, Serialize};
use weft_core::{CoreError, CoreResult};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Async threads driving timers
    pub timer_threads: usize,
    /// Threads executing workers
    pub pool_size: usize,
    /// Maximum workers alive at once across the process
    pub max_outstanding_workers: usize,
    /// Prefix of pool thread names
    pub thread_name: String,
    /// How long an idle pool thread is kept, in milliseconds
    pub keep_alive_ms: u64,
}

impl RuntimeConfig {
    /// Create a config with defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            timer_threads: 1,
            pool_size: 64,
            max_outstanding_workers: 10_000,
            thread_name: "weft-worker".to_string(),
            keep_alive_ms: 10_000,
        }
    }

    /// Set the worker pool size
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the outstanding worker limit
    #[must_use]
    pub fn with_max_outstanding_workers(mut self, max: usize) -> Self {
        self.max_outstanding_workers = max;
        self
    }

    /// Set the thread name prefix
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Parse a JSON document; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the result is invalid
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid field
    pub fn validate(&self) -> CoreResult<()> {
        if self.timer_threads == 0 {
            return Err(CoreError::Validation {
                field: "timer_threads".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pool_size == 0 {
            return Err(CoreError::Validation {
                field: "pool_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_outstanding_workers == 0 {
            return Err(CoreError::Validation {
                field: "max_outstanding_workers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.pool_size, 64);
        assert_eq!(config.timer_threads, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builders() {
        let config = RuntimeConfig::new()
            .with_pool_size(4)
            .with_max_outstanding_workers(8)
            .with_thread_name("test-pool");
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.max_outstanding_workers, 8);
        assert_eq!(config.thread_name, "test-pool");
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = RuntimeConfig::from_json(r#"{"pool_size": 3}"#).unwrap();
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.max_outstanding_workers, 10_000);
    }

    #[test]
    fn test_config_rejects_zero_pool() {
        let err = RuntimeConfig::from_json(r#"{"pool_size": 0}"#).unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "pool_size"));
    }

    #[test]
    fn test_config_rejects_bad_json() {
        assert!(matches!(
            RuntimeConfig::from_json("{"),
            Err(CoreError::ParseError { .. })
        ));
    }
}
