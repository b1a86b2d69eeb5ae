use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::ConsumerId;
use crate::error::ConfigError;

/// Default delay between a driver disappearing and the idle sweep.
pub const DEFAULT_IDLE_CHECK_DELAY_MS: u64 = 1000;

/// Default consumer id the engine itself holds devices under.
pub const DEFAULT_ENGINE_CONSUMER: &str = "das.engine";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub idle_check_delay_ms: u64,
    pub engine_consumer: String,
    /// Optional cap on attempts per attachment session. The effective cap is
    /// never larger than the number of known drivers plus one.
    pub max_session_attempts: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_check_delay_ms: DEFAULT_IDLE_CHECK_DELAY_MS,
            engine_consumer: DEFAULT_ENGINE_CONSUMER.to_string(),
            max_session_attempts: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine_consumer.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "engineConsumer",
                reason: "must not be empty".to_string(),
            });
        }
        if self.max_session_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                key: "maxSessionAttempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn idle_check_delay(&self) -> Duration {
        Duration::from_millis(self.idle_check_delay_ms)
    }

    pub fn engine_consumer(&self) -> ConsumerId {
        ConsumerId::new(self.engine_consumer.as_str())
    }

    /// Attempt bound for a session when `known_drivers` drivers are tracked.
    pub fn session_limit(&self, known_drivers: usize) -> usize {
        let structural = known_drivers + 1;
        match self.max_session_attempts {
            Some(cap) => cap.min(structural),
            None => structural,
        }
    }
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineConfig
    Idle check delay: {} ms,
    Engine consumer: {},
    Max session attempts: {}",
            self.idle_check_delay_ms,
            self.engine_consumer,
            self.max_session_attempts
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unbounded".to_string()),
        )
    }
}
