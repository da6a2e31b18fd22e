//! Session identity.

use std::fmt;
use std::path::{Path, PathBuf};

/// The (local store, server, user) triple that names a sync session.
///
/// Two identities are the same session exactly when all three parts match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    store_path: PathBuf,
    server_url: String,
    user: String,
}

impl SessionIdentity {
    /// Creates an identity.
    pub fn new(
        store_path: impl Into<PathBuf>,
        server_url: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            store_path: store_path.into(),
            server_url: server_url.into(),
            user: user.into(),
        }
    }

    /// Returns the local store path.
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Returns the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Returns the user identity.
    pub fn user(&self) -> &str {
        &self.user
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            self.user,
            self.server_url,
            self.store_path.display()
        )
    }
}
