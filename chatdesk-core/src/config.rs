//! Core configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding the idle timeout.
pub const SESSION_TIMEOUT_ENV: &str = "CHATDESK_SESSION_TIMEOUT_MINUTES";

/// Default idle window before a session rolls over (12 hours).
pub const DEFAULT_IDLE_TIMEOUT_MINUTES: i64 = 720;

/// Session lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Minutes a session may stay idle and still receive messages (default: 720)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: i64,
}

fn default_idle_timeout() -> i64 {
    DEFAULT_IDLE_TIMEOUT_MINUTES
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: DEFAULT_IDLE_TIMEOUT_MINUTES,
        }
    }
}

impl SessionConfig {
    pub fn with_idle_timeout(minutes: i64) -> Result<Self> {
        let config = Self {
            idle_timeout_minutes: minutes,
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overridden by `CHATDESK_SESSION_TIMEOUT_MINUTES` when set.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env()
    }

    /// Apply the environment override on top of an existing configuration.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(raw) = std::env::var(SESSION_TIMEOUT_ENV) {
            self.idle_timeout_minutes = raw.trim().parse().map_err(|_| {
                Error::Config(format!("{} must be a whole number of minutes, got '{}'", SESSION_TIMEOUT_ENV, raw))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_minutes <= 0 {
            return Err(Error::Config(format!(
                "idle_timeout_minutes must be positive, got {}",
                self.idle_timeout_minutes
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.idle_timeout_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_timeout_is_twelve_hours() {
        let config = SessionConfig::default();
        assert_eq!(config.idle_timeout_minutes, 720);
        assert_eq!(config.idle_timeout(), chrono::Duration::hours(12));
    }

    #[test]
    fn test_rejects_non_positive_timeout() {
        assert!(SessionConfig::with_idle_timeout(0).is_err());
        assert!(SessionConfig::with_idle_timeout(-5).is_err());
        assert_eq!(SessionConfig::with_idle_timeout(30).unwrap().idle_timeout_minutes, 30);
    }

    #[test]
    fn test_deserialize_missing_field_uses_default() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_env_override() {
        // Save current value to restore later
        let old_val = env::var(SESSION_TIMEOUT_ENV).ok();

        // SAFETY: This test is the only one touching this variable and restores it afterward
        unsafe { env::set_var(SESSION_TIMEOUT_ENV, "45") };
        assert_eq!(SessionConfig::from_env().unwrap().idle_timeout_minutes, 45);

        unsafe { env::set_var(SESSION_TIMEOUT_ENV, "soon") };
        let err = SessionConfig::from_env().unwrap_err();
        assert!(err.to_string().contains(SESSION_TIMEOUT_ENV));

        // SAFETY: Restoring environment to previous state
        unsafe {
            match old_val {
                Some(val) => env::set_var(SESSION_TIMEOUT_ENV, val),
                None => env::remove_var(SESSION_TIMEOUT_ENV),
            }
        }
    }
}
