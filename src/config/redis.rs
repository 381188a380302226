//! Redis configuration

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;

/// Redis configuration (the pub/sub broker)
///
/// Not `Clone`: the password is a `SecretString`.
#[derive(Debug, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Password, when not embedded in the URL
    #[serde(default)]
    pub password: Option<SecretString>,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl RedisConfig {
    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Build connection info, applying the separate password if set.
    pub fn connection_info(&self) -> redis::RedisResult<redis::ConnectionInfo> {
        use redis::IntoConnectionInfo;

        let mut info = self.url.as_str().into_connection_info()?;
        if let Some(password) = &self.password {
            info.redis.password = Some(password.expose_secret().clone());
        }
        Ok(info)
    }

    /// Validate Redis configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.is_empty() {
            return Err(ValidationError::MissingRequired("REDIS_URL"));
        }
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(ValidationError::InvalidRedisUrl);
        }
        if self.connect_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout("redis.connect_timeout_secs"));
        }
        Ok(())
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            password: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5
}
