//! Token provider collaborator contract.

use crate::identity::SessionIdentity;
use async_trait::async_trait;
use strand_protocol::AccessToken;
use thiserror::Error;

/// Errors reported by a token provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Credentials are invalid or the user was revoked. Never retried.
    #[error("token rejected: {0}")]
    Rejected(String),

    /// The authentication server could not be reached.
    #[error("network error: {0}")]
    Network(String),
}

impl TokenError {
    /// Returns true if the request may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TokenError::Network(_))
    }
}

/// Issues and refreshes access tokens for session users.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Authenticates the identity's user and returns a fresh token.
    async fn acquire_token(&self, identity: &SessionIdentity) -> Result<AccessToken, TokenError>;

    /// Exchanges an expiring token for a new one.
    async fn refresh(
        &self,
        identity: &SessionIdentity,
        token: &AccessToken,
    ) -> Result<AccessToken, TokenError>;
}
