//! Error types for the sync server.

use strand_protocol::CodecError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The user may not obtain tokens.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The presented token is malformed, forged or expired.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// A changeset frame could not be decoded or encoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if the request was at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotAuthorized(_)
                | ServerError::Codec(_)
        )
    }

    /// Returns true if the server was at fault.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_))
    }

    /// Returns true if the caller should obtain a new token and retry.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, ServerError::NotAuthorized(_))
    }
}

impl From<CodecError> for ServerError {
    fn from(error: CodecError) -> Self {
        ServerError::Codec(error.to_string())
    }
}
