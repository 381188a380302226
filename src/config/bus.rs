//! Event bus configuration

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;

/// Event bus configuration (channels, timeouts, reconnect policy)
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Namespace prepended to every broker channel (shared brokers)
    #[serde(default)]
    pub channel_prefix: Option<String>,

    /// Publish acknowledgement timeout in milliseconds
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// Subscribe confirmation timeout in milliseconds
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_ms: u64,

    /// How long applied stateful events are remembered, in seconds
    #[serde(default = "default_processed_event_ttl")]
    pub processed_event_ttl_secs: u64,

    /// Capacity of the local room activity change channel
    #[serde(default = "default_room_change_capacity")]
    pub room_change_capacity: usize,

    /// Reconnect / resubscribe backoff
    #[serde(default)]
    pub reconnect: BackoffConfig,
}

impl BusConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn processed_event_ttl(&self) -> Duration {
        Duration::from_secs(self.processed_event_ttl_secs)
    }

    /// Channel prefix with empty strings treated as unset.
    pub fn channel_prefix(&self) -> Option<&str> {
        self.channel_prefix.as_deref().filter(|p| !p.is_empty())
    }

    /// Validate bus configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.publish_timeout_ms == 0 {
            return Err(ValidationError::InvalidTimeout("bus.publish_timeout_ms"));
        }
        if self.subscribe_timeout_ms == 0 {
            return Err(ValidationError::InvalidTimeout("bus.subscribe_timeout_ms"));
        }
        if self.processed_event_ttl_secs == 0 {
            return Err(ValidationError::InvalidTimeout("bus.processed_event_ttl_secs"));
        }
        if self.room_change_capacity == 0 {
            return Err(ValidationError::MissingRequired("bus.room_change_capacity"));
        }
        if let Some(prefix) = self.channel_prefix() {
            if prefix.chars().any(char::is_whitespace)
                || prefix.starts_with(':')
                || prefix.ends_with(':')
            {
                return Err(ValidationError::InvalidChannelPrefix);
            }
        }
        self.reconnect.validate()
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_prefix: None,
            publish_timeout_ms: default_publish_timeout(),
            subscribe_timeout_ms: default_subscribe_timeout(),
            processed_event_ttl_secs: default_processed_event_ttl(),
            room_change_capacity: default_room_change_capacity(),
            reconnect: BackoffConfig::default(),
        }
    }
}

/// Capped exponential backoff
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Give up after this many attempts (unbounded when unset)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Returns true if `attempt` (1-based) may still be tried.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.initial_delay_ms == 0 {
            return Err(ValidationError::InvalidTimeout("bus.reconnect.initial_delay_ms"));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ValidationError::InvalidBackoff);
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: None,
        }
    }
}

fn default_publish_timeout() -> u64 {
    1000
}

fn default_subscribe_timeout() -> u64 {
    3000
}

fn default_processed_event_ttl() -> u64 {
    3600
}

fn default_room_change_capacity() -> usize {
    256
}

fn default_initial_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_config_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.publish_timeout(), Duration::from_millis(1000));
        assert_eq!(config.subscribe_timeout(), Duration::from_millis(3000));
        assert_eq!(config.processed_event_ttl(), Duration::from_secs(3600));
        assert_eq!(config.channel_prefix(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_prefix_treated_as_unset() {
        let config = BusConfig {
            channel_prefix: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(config.channel_prefix(), None);
    }

    #[test]
    fn test_prefix_with_separator_rejected() {
        let config = BusConfig {
            channel_prefix: Some("interviews:".to_string()),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::InvalidChannelPrefix));
    }

    #[test]
    fn test_zero_publish_timeout_rejected() {
        let config = BusConfig {
            publish_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let backoff = BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            max_attempts: None,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_attempt_limit() {
        let bounded = BackoffConfig {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(bounded.allows_attempt(3));
        assert!(!bounded.allows_attempt(4));
        assert!(BackoffConfig::default().allows_attempt(u32::MAX));
    }

    #[test]
    fn test_backoff_initial_above_max_rejected() {
        let backoff = BackoffConfig {
            initial_delay_ms: 10_000,
            max_delay_ms: 100,
            max_attempts: None,
        };
        assert_eq!(backoff.validate(), Err(ValidationError::InvalidBackoff));
    }
}
