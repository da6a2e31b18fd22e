//! Server configuration.

use serde::Deserialize;
use std::time::Duration;

/// Token authority configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Secret key for HMAC signatures.
    pub secret: Vec<u8>,
    /// Lifetime of issued tokens.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a configuration with the given secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(60 * 60),
        }
    }

    /// Sets the token lifetime.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new(b"strand-development-secret".to_vec())
    }
}

/// Configuration for the sync server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Token authority settings.
    pub auth: AuthConfig,
    /// Changesets buffered per live subscriber before it must catch up
    /// from the log.
    pub feed_capacity: usize,
}

impl ServerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            auth: AuthConfig::default(),
            feed_capacity: 1024,
        }
    }

    /// Sets the token authority settings.
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the lifetime of issued tokens.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.auth.token_expiry = expiry;
        self
    }

    /// Sets the per-subscriber buffer.
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_auth(AuthConfig::new(vec![1, 2, 3, 4]))
            .with_token_expiry(Duration::from_secs(5))
            .with_feed_capacity(0);

        assert_eq!(config.auth.secret, vec![1, 2, 3, 4]);
        assert_eq!(config.auth.token_expiry, Duration::from_secs(5));
        assert_eq!(config.feed_capacity, 1);
    }
}
