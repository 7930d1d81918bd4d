use crate::error::ConfigError;
use crate::timeouts::{
    CHECKPOINT_BUFFER_BASE_SIZE, CHECKPOINT_MAX_PERIOD, CHECKPOINT_MIN_PERIOD, IDLE_POLL,
    LIVE_MIGRATE_THRESHOLD_BYTES, MAX_DEVICE_STATE_BYTES, SECONDARY_FAILOVER_GRACE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables shared by both checkpoint loops. Missing YAML fields fall back to
/// the defaults in [`crate::timeouts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub min_period_ms: u64,
    pub checkpoint_period_ms: u64,
    pub live_migrate_threshold_bytes: u64,
    pub idle_poll_ms: u64,
    pub failover_grace_ms: u64,
    pub buffer_capacity_bytes: usize,
    pub max_device_state_bytes: u64,
    pub replication_requested: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            min_period_ms: CHECKPOINT_MIN_PERIOD.as_millis() as u64,
            checkpoint_period_ms: CHECKPOINT_MAX_PERIOD.as_millis() as u64,
            live_migrate_threshold_bytes: LIVE_MIGRATE_THRESHOLD_BYTES,
            idle_poll_ms: IDLE_POLL.as_millis() as u64,
            failover_grace_ms: SECONDARY_FAILOVER_GRACE.as_millis() as u64,
            buffer_capacity_bytes: CHECKPOINT_BUFFER_BASE_SIZE,
            max_device_state_bytes: MAX_DEVICE_STATE_BYTES,
            replication_requested: true,
        }
    }
}

impl CheckpointConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: CheckpointConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "min_period_ms",
                reason: "must be positive",
            });
        }
        if self.checkpoint_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "checkpoint_period_ms",
                reason: "must be positive",
            });
        }
        if self.min_period_ms > self.checkpoint_period_ms {
            return Err(ConfigError::Invalid {
                field: "min_period_ms",
                reason: "must not exceed checkpoint_period_ms",
            });
        }
        if self.idle_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "idle_poll_ms",
                reason: "must be positive",
            });
        }
        if self.max_device_state_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_device_state_bytes",
                reason: "must be positive",
            });
        }
        Ok(())
    }

    pub fn min_period(&self) -> Duration {
        Duration::from_millis(self.min_period_ms)
    }

    pub fn checkpoint_period(&self) -> Duration {
        Duration::from_millis(self.checkpoint_period_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn failover_grace(&self) -> Duration {
        Duration::from_millis(self.failover_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_timing_policy() {
        let config = CheckpointConfig::default();
        assert_eq!(config.min_period(), Duration::from_millis(100));
        assert_eq!(config.checkpoint_period(), Duration::from_secs(10));
        assert_eq!(config.live_migrate_threshold_bytes, 10 * 1024 * 1024);
        assert_eq!(config.failover_grace(), Duration::from_secs(2));
        config.validate().unwrap();
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = CheckpointConfig::from_yaml_str("checkpoint_period_ms: 2500\n").unwrap();
        assert_eq!(config.checkpoint_period(), Duration::from_millis(2500));
        assert_eq!(config.min_period_ms, 100);
        assert!(config.replication_requested);
    }

    #[test]
    fn rejects_min_period_above_max_period() {
        let err = CheckpointConfig::from_yaml_str("min_period_ms: 500\ncheckpoint_period_ms: 200\n")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "min_period_ms",
                ..
            }
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "idle_poll_ms: 20\nfailover_grace_ms: 50").unwrap();
        let config = CheckpointConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.idle_poll(), Duration::from_millis(20));
        assert_eq!(config.failover_grace(), Duration::from_millis(50));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = CheckpointConfig::from_yaml_str("min_period_ms: [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
