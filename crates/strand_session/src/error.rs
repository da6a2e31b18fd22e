//! Error types for the session manager.

use crate::store::StoreError;
use crate::wait::Termination;
use thiserror::Error;

/// Result type for session operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by sessions, the registry and the manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The session's local store has been closed; the reference is dead.
    #[error("session is closed: its local store has been closed")]
    ClosedSession,

    /// No live session exists for the identity.
    #[error("no live session for {0}")]
    SessionNotFound(String),

    /// A checkpoint wait was aborted by cancellation or timeout.
    #[error("wait interrupted")]
    Interrupted,

    /// The session logged out while the caller was waiting.
    #[error("session is ending")]
    SessionEnding,

    /// The token provider rejected the user.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The transport reported an unrecoverable protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The background worker has shut down or could not start.
    #[error("sync worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The identity does not match the store it was opened with.
    #[error("invalid session identity: {0}")]
    InvalidIdentity(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Interrupted => true,
            _ => false,
        }
    }

    /// Returns true if the session can no longer make progress.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthenticationFailed(_) | SyncError::Protocol(_)
        )
    }

    /// Returns true if a checkpoint wait was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SyncError::Interrupted)
    }
}

impl From<Termination> for SyncError {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Ending => SyncError::SessionEnding,
            Termination::Closed => SyncError::ClosedSession,
            Termination::Authentication(message) => SyncError::AuthenticationFailed(message),
            Termination::Protocol(message) => SyncError::Protocol(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Interrupted.is_retryable());
        assert!(!SyncError::ClosedSession.is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(SyncError::AuthenticationFailed("revoked".into()).is_fatal());
        assert!(SyncError::Protocol("bad frame".into()).is_fatal());
        assert!(!SyncError::Interrupted.is_fatal());
        assert!(SyncError::Interrupted.is_interrupted());
    }

    #[test]
    fn terminations_map_to_errors() {
        assert_eq!(SyncError::from(Termination::Ending), SyncError::SessionEnding);
        assert_eq!(SyncError::from(Termination::Closed), SyncError::ClosedSession);
        assert!(SyncError::from(Termination::Authentication("no".into())).is_fatal());
    }

    #[test]
    fn error_display() {
        let err = SyncError::ClosedSession;
        assert!(err.to_string().contains("closed"));

        let err = SyncError::InvalidStateTransition {
            from: "Inactive".into(),
            to: "Active".into(),
        };
        assert!(err.to_string().contains("Inactive"));
        assert!(err.to_string().contains("Active"));
    }
}
