//! Session state machine.

use std::fmt;

/// The lifecycle state of a sync session.
///
/// ```text
/// WaitingForAccessToken <-> Active
///          |                  |
///          +------> Dying <---+
///                     |
///                  Inactive
///
/// any state -----> FatalError
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the token provider; the initial state.
    WaitingForAccessToken,
    /// Authenticated and connected; changes flow both ways.
    Active,
    /// Logging out: in-flight work drains, waiters are released.
    Dying,
    /// Logged out. Terminal for this login.
    Inactive,
    /// Unrecoverable authentication or protocol failure. Terminal.
    FatalError,
}

impl SessionState {
    /// Returns true if no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Inactive | SessionState::FatalError)
    }

    /// Returns true if the session is exchanging changes with the server.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (FatalError, _) => false,
            (_, FatalError) => true,
            (WaitingForAccessToken, Active) => true,
            (Active, WaitingForAccessToken) => true,
            (WaitingForAccessToken | Active, Dying) => true,
            (Dying, Inactive) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::WaitingForAccessToken => "WAITING_FOR_ACCESS_TOKEN",
            SessionState::Active => "ACTIVE",
            SessionState::Dying => "DYING",
            SessionState::Inactive => "INACTIVE",
            SessionState::FatalError => "FATAL_ERROR",
        };
        f.write_str(name)
    }
}
