use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RotationError;

/// Floor for both the rotation and the check interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const DAY_SECS: u64 = 24 * 60 * 60;

/// Rotation scheduler settings. Missing JSON fields take the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub enabled: bool,
    /// Age at which an identity key is replaced.
    pub rotation_interval_secs: u64,
    /// How often the scheduler looks for due keys.
    pub check_interval_secs: u64,
    /// Attempts for key generation and for key storage, each.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rotation_interval_secs: 30 * DAY_SECS,
            check_interval_secs: DAY_SECS,
            max_attempts: 3,
            retry_delay_ms: 100,
        }
    }
}

impl RotationConfig {
    pub fn from_json(json: &str) -> Result<Self, RotationError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Configured rotation interval, raised to [`MIN_INTERVAL`].
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs).max(MIN_INTERVAL)
    }

    /// Configured check interval, raised to [`MIN_INTERVAL`].
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs).max(MIN_INTERVAL)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Raise `interval` to [`MIN_INTERVAL`], warning when it had to.
pub(crate) fn clamp_interval(interval: Duration, which: &str) -> Duration {
    if interval < MIN_INTERVAL {
        tracing::warn!(
            requested_secs = interval.as_secs(),
            minimum_secs = MIN_INTERVAL.as_secs(),
            "{which} interval too short, using minimum"
        );
        MIN_INTERVAL
    } else {
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RotationConfig::default();
        assert!(config.enabled);
        assert_eq!(config.rotation_interval(), Duration::from_secs(30 * DAY_SECS));
        assert_eq!(config.check_interval(), MIN_INTERVAL);
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.retry_delay(), Duration::from_millis(100));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RotationConfig::from_json(r#"{"rotation_interval_secs": 864000}"#).unwrap();
        assert_eq!(config.rotation_interval(), Duration::from_secs(10 * DAY_SECS));
        assert_eq!(config.max_attempts, 3);
        assert!(config.enabled);
    }

    #[test]
    fn short_intervals_are_clamped() {
        let config = RotationConfig {
            rotation_interval_secs: 60,
            check_interval_secs: 0,
            max_attempts: 0,
            ..RotationConfig::default()
        };
        assert_eq!(config.rotation_interval(), MIN_INTERVAL);
        assert_eq!(config.check_interval(), MIN_INTERVAL);
        assert_eq!(config.max_attempts(), 1);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            RotationConfig::from_json(r#"{"enabled": "yes"}"#),
            Err(RotationError::Config(_))
        ));
    }
}
