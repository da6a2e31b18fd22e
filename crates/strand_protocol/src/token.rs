//! Access tokens.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// A short-lived credential authorizing one user against the sync server.
///
/// Tokens only live in memory for the lifetime of a session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    /// Opaque token value presented to the server.
    pub value: String,
    /// User the token was issued to.
    pub user: String,
    /// Instant after which the server rejects the token.
    pub expires_at: SystemTime,
}

impl AccessToken {
    /// Creates a token.
    pub fn new(value: impl Into<String>, user: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            value: value.into(),
            user: user.into(),
            expires_at,
        }
    }

    /// Returns true if the token has expired at `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Returns true if the token has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Returns the time left before expiry, zero once expired.
    pub fn time_to_expiry(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

// The value is a credential; keep it out of logs.
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("user", &self.user)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
