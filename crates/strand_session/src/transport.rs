//! Changeset transport collaborator contract.

use crate::error::SyncResult;
use crate::identity::SessionIdentity;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use strand_protocol::{AccessToken, Changeset, Version};
use thiserror::Error;

/// Errors reported by a changeset transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection dropped or timed out; the operation may be retried.
    #[error("network error: {0}")]
    Network(String),

    /// The server refused the current access token.
    #[error("token rejected: {0}")]
    TokenRejected(String),

    /// The server or the wire violated the protocol. Never retried.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Remote changesets in server order.
pub type ChangesetStream = BoxStream<'static, TransportResult<Changeset>>;

/// A live connection between one session and the sync server.
///
/// The transport abstracts the network layer so a session can run over a
/// socket, an in-process server, or a test double.
#[async_trait]
pub trait ChangesetTransport: Send + Sync {
    /// Connects with `token`. On a live connection this re-authenticates
    /// with a refreshed token and keeps the receive stream open.
    async fn connect(&self, token: &AccessToken) -> TransportResult<()>;

    /// Closes the connection. The receive stream ends.
    async fn disconnect(&self);

    /// Uploads a changeset. `Ok` means the server acknowledged it.
    async fn send(&self, changeset: &Changeset) -> TransportResult<()>;

    /// Streams server changesets newer than `after`.
    ///
    /// The stream is infinite while connected and cannot be restarted after
    /// `disconnect`; call once per connection.
    fn receive(&self, after: Version) -> ChangesetStream;

    /// Returns the newest version the server knows of.
    async fn server_high_water_mark(&self) -> TransportResult<Version>;
}

/// Creates the transport owned by a session.
pub trait TransportConnector: Send + Sync {
    /// Builds an unconnected transport for `identity`.
    fn create(&self, identity: &SessionIdentity) -> SyncResult<Arc<dyn ChangesetTransport>>;
}
