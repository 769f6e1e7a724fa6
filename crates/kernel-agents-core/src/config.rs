//! Engine configuration.
//!
//! Resolution order, lowest priority first:
//! 1. Built-in defaults
//! 2. JSON config file (optional)
//! 3. Environment variables

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Overrides `execution.default_timeout_secs`.
pub const ENV_EXEC_TIMEOUT: &str = "KERNEL_AGENTS_EXEC_TIMEOUT_SECS";
/// Overrides `delegation.timeout_secs`.
pub const ENV_DELEGATION_TIMEOUT: &str = "KERNEL_AGENTS_DELEGATION_TIMEOUT_SECS";
/// Overrides `sessions.max_idle_secs`.
pub const ENV_SESSION_MAX_IDLE: &str = "KERNEL_AGENTS_SESSION_MAX_IDLE_SECS";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
}

/// Single execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Wall-clock bound for synchronous executions.
    pub default_timeout_secs: u64,
    /// How long to keep reading events after the reply arrived.
    pub grace_period_ms: u64,
    /// Per-iteration wait while the reply is outstanding.
    pub poll_interval_ms: u64,
    /// Per-iteration wait during the grace period.
    pub grace_poll_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            grace_period_ms: 100,
            poll_interval_ms: 1000,
            grace_poll_interval_ms: 50,
        }
    }
}

impl ExecutionConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn grace_poll_interval(&self) -> Duration {
        Duration::from_millis(self.grace_poll_interval_ms)
    }
}

/// Batch execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Pause after a restart before the first unit runs.
    pub restart_settle_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            restart_settle_ms: 2000,
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub const fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

/// Remote delegation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    pub timeout_secs: u64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl DelegationConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-owner session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session is evicted by the sweeper.
    pub max_idle_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl EngineConfig {
    /// Resolve configuration from defaults, an optional file and the environment.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or an override is not a number.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    ///
    /// # Errors
    /// Returns error if a present variable is not a non-negative integer.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let parse = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(var)
                .map(|value| {
                    value
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidEnv { var, value })
                })
                .transpose()
        };
        if let Some(secs) = parse(ENV_EXEC_TIMEOUT)? {
            self.execution.default_timeout_secs = secs;
        }
        if let Some(secs) = parse(ENV_DELEGATION_TIMEOUT)? {
            self.delegation.timeout_secs = secs;
        }
        if let Some(secs) = parse(ENV_SESSION_MAX_IDLE)? {
            self.sessions.max_idle_secs = secs;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"execution": {"grace_period_ms": 250}}"#).unwrap();
        assert_eq!(config.execution.grace_period(), Duration::from_millis(250));
        assert_eq!(config.execution.default_timeout(), Duration::from_secs(300));
        assert_eq!(config.delegation.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [(ENV_EXEC_TIMEOUT, "12"), (ENV_SESSION_MAX_IDLE, " 60 ")]
            .into_iter()
            .collect();
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|var| env.get(var).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.execution.default_timeout_secs, 12);
        assert_eq!(config.sessions.max_idle(), Duration::from_secs(60));
        assert_eq!(config.delegation.timeout_secs, 30);
    }

    #[test]
    fn bad_env_value_is_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|var| (var == ENV_DELEGATION_TIMEOUT).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                var: ENV_DELEGATION_TIMEOUT,
                ..
            }
        ));
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.batch.restart_settle(), Duration::from_secs(2));
    }
}
