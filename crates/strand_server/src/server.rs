//! Main sync server.

use crate::auth::TokenAuthority;
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::log::{ChangesetLog, Subscription};
use std::sync::Arc;
use strand_protocol::{decode_changeset, encode_changeset, Version};
use tracing::debug;

/// The sync server.
///
/// Holds one shared changeset history for every user. Uploads and
/// downloads travel as CBOR frames, the same bytes a network transport
/// would carry, and every request is authorized with an access token.
///
/// # Example
///
/// ```
/// use strand_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let token = server.authority().issue("alice").unwrap();
/// assert_eq!(server.high_water_mark(&token.value).unwrap().get(), 0);
/// ```
pub struct SyncServer {
    authority: TokenAuthority,
    log: Arc<ChangesetLog>,
}

impl SyncServer {
    /// Creates a new sync server.
    pub fn new(config: ServerConfig) -> Self {
        let log = Arc::new(ChangesetLog::new(config.feed_capacity));
        Self::with_log(config, log)
    }

    /// Creates a sync server over an existing log.
    pub fn with_log(config: ServerConfig, log: Arc<ChangesetLog>) -> Self {
        Self {
            authority: TokenAuthority::new(config.auth),
            log,
        }
    }

    /// Returns the token authority.
    pub fn authority(&self) -> &TokenAuthority {
        &self.authority
    }

    /// Returns the changeset log.
    pub fn log(&self) -> &Arc<ChangesetLog> {
        &self.log
    }

    /// Validates a token and returns its user.
    pub fn authenticate(&self, token: &str) -> ServerResult<String> {
        self.authority.validate(token)
    }

    /// Integrates an encoded changeset and returns its server version.
    pub fn push(&self, token: &str, frame: &[u8]) -> ServerResult<Version> {
        let user = self.authenticate(token)?;
        let changeset = decode_changeset(frame)?;
        let version = self.log.integrate(changeset)?;
        debug!(user, version = %version, "push accepted");
        Ok(version)
    }

    /// Returns the latest server version.
    pub fn high_water_mark(&self, token: &str) -> ServerResult<Version> {
        self.authenticate(token)?;
        Ok(self.log.high_water_mark())
    }

    /// Opens a feed of encoded changesets newer than `after`.
    pub fn subscribe(&self, token: &str, after: Version) -> ServerResult<FrameFeed> {
        let user = self.authenticate(token)?;
        debug!(user, after = %after, "subscriber attached");
        Ok(FrameFeed {
            subscription: self.log.subscribe(after),
        })
    }

    /// Returns the number of changesets in the log.
    pub fn changeset_count(&self) -> usize {
        self.log.len()
    }
}

impl Default for SyncServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

/// A subscription that yields CBOR frames.
pub struct FrameFeed {
    subscription: Subscription,
}

impl FrameFeed {
    /// Returns the next frame, waiting for a changeset to be integrated.
    pub async fn next_frame(&mut self) -> Option<ServerResult<Vec<u8>>> {
        let changeset = self.subscription.recv().await?;
        Some(encode_changeset(&changeset).map_err(Into::into))
    }
}
