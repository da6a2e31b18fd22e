//! Transport and token provider backed by an in-process [`SyncServer`].

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strand_protocol::{decode_changeset, encode_changeset, AccessToken, Changeset, Version};
use strand_server::{ServerError, SyncServer};
use strand_session::{
    ChangesetStream, ChangesetTransport, SessionIdentity, SyncResult, TokenError, TokenProvider,
    TransportConnector, TransportError, TransportResult,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::faults::{FaultPlan, FlakyTransport};

/// Maps a server error to what a client transport would report.
pub fn transport_error(error: ServerError) -> TransportError {
    match error {
        ServerError::NotAuthorized(message) | ServerError::AuthenticationFailed(message) => {
            TransportError::TokenRejected(message)
        }
        ServerError::Internal(message) => TransportError::Network(message),
        other => TransportError::Protocol(other.to_string()),
    }
}

/// A [`ChangesetTransport`] talking to a [`SyncServer`] through CBOR frames.
pub struct ServerTransport {
    server: Arc<SyncServer>,
    token: Mutex<Option<String>>,
    connection: Mutex<CancellationToken>,
}

impl ServerTransport {
    /// Creates a disconnected transport.
    pub fn new(server: Arc<SyncServer>) -> Self {
        let connection = CancellationToken::new();
        connection.cancel();
        Self {
            server,
            token: Mutex::new(None),
            connection: Mutex::new(connection),
        }
    }

    /// Returns true while connected.
    pub fn is_connected(&self) -> bool {
        !self.connection.lock().is_cancelled()
    }

    fn current_token(&self) -> TransportResult<String> {
        self.token
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Network("not connected".into()))
    }
}

#[async_trait]
impl ChangesetTransport for ServerTransport {
    async fn connect(&self, token: &AccessToken) -> TransportResult<()> {
        self.server
            .authenticate(&token.value)
            .map_err(transport_error)?;
        *self.token.lock() = Some(token.value.clone());
        let mut connection = self.connection.lock();
        if connection.is_cancelled() {
            *connection = CancellationToken::new();
        }
        debug!(user = %token.user, "transport connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.token.lock().take();
        self.connection.lock().cancel();
    }

    async fn send(&self, changeset: &Changeset) -> TransportResult<()> {
        let token = self.current_token()?;
        let frame =
            encode_changeset(changeset).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.server
            .push(&token, &frame)
            .map(|_| ())
            .map_err(transport_error)
    }

    fn receive(&self, after: Version) -> ChangesetStream {
        let connection = self.connection.lock().clone();
        let feed = self
            .current_token()
            .and_then(|token| self.server.subscribe(&token, after).map_err(transport_error));
        let feed = match feed {
            Ok(feed) => feed,
            Err(error) => return stream::once(async move { Err(error) }).boxed(),
        };

        stream::unfold((feed, connection), |(mut feed, connection)| async move {
            let frame = tokio::select! {
                _ = connection.cancelled() => return None,
                frame = feed.next_frame() => frame?,
            };
            let item = frame.map_err(transport_error).and_then(|bytes| {
                decode_changeset(&bytes).map_err(|e| TransportError::Protocol(e.to_string()))
            });
            Some((item, (feed, connection)))
        })
        .boxed()
    }

    async fn server_high_water_mark(&self) -> TransportResult<Version> {
        let token = self.current_token()?;
        self.server.high_water_mark(&token).map_err(transport_error)
    }
}

/// Creates [`ServerTransport`]s, optionally wrapped with injected faults.
pub struct ServerConnector {
    server: Arc<SyncServer>,
    faults: Option<Arc<FaultPlan>>,
    created: AtomicUsize,
}

impl ServerConnector {
    /// Creates a connector for `server`.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            faults: None,
            created: AtomicUsize::new(0),
        }
    }

    /// Wraps every transport created from now on in a [`FlakyTransport`].
    pub fn with_faults(mut self, plan: Arc<FaultPlan>) -> Self {
        self.faults = Some(plan);
        self
    }

    /// Returns the number of transports created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransportConnector for ServerConnector {
    fn create(&self, identity: &SessionIdentity) -> SyncResult<Arc<dyn ChangesetTransport>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(session = %identity, "creating transport");
        let transport: Arc<dyn ChangesetTransport> =
            Arc::new(ServerTransport::new(Arc::clone(&self.server)));
        Ok(match &self.faults {
            Some(plan) => Arc::new(FlakyTransport::new(transport, Arc::clone(plan))),
            None => transport,
        })
    }
}

/// A [`TokenProvider`] backed by the server's token authority.
pub struct AuthorityTokenProvider {
    server: Arc<SyncServer>,
    faults: Option<Arc<FaultPlan>>,
    acquired: AtomicUsize,
    refreshed: AtomicUsize,
}

impl AuthorityTokenProvider {
    /// Creates a provider for `server`.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            faults: None,
            acquired: AtomicUsize::new(0),
            refreshed: AtomicUsize::new(0),
        }
    }

    /// Consults `plan` for injected token failures.
    pub fn with_faults(mut self, plan: Arc<FaultPlan>) -> Self {
        self.faults = Some(plan);
        self
    }

    /// Returns the number of tokens issued by `acquire_token`.
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Returns the number of tokens issued by `refresh`.
    pub fn refreshed(&self) -> usize {
        self.refreshed.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Result<(), TokenError> {
        match &self.faults {
            Some(plan) if plan.take_token_failure() => {
                Err(TokenError::Network("injected token failure".into()))
            }
            _ => Ok(()),
        }
    }
}

fn token_error(error: ServerError) -> TokenError {
    match error {
        ServerError::Internal(message) => TokenError::Network(message),
        other => TokenError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl TokenProvider for AuthorityTokenProvider {
    async fn acquire_token(&self, identity: &SessionIdentity) -> Result<AccessToken, TokenError> {
        self.injected_failure()?;
        let token = self
            .server
            .authority()
            .issue(identity.user())
            .map_err(token_error)?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(token)
    }

    async fn refresh(
        &self,
        _identity: &SessionIdentity,
        token: &AccessToken,
    ) -> Result<AccessToken, TokenError> {
        self.injected_failure()?;
        let token = self.server.authority().refresh(token).map_err(token_error)?;
        self.refreshed.fetch_add(1, Ordering::SeqCst);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_protocol::{ClientId, ObjectChange};

    fn identity(user: &str) -> SessionIdentity {
        SessionIdentity::new("/tmp/dogs.db", "strand://test", user)
    }

    #[tokio::test]
    async fn round_trip_through_server() {
        let server = Arc::new(SyncServer::default());
        let tokens = AuthorityTokenProvider::new(Arc::clone(&server));
        let token = tokens.acquire_token(&identity("alice")).await.unwrap();

        let transport = ServerTransport::new(Arc::clone(&server));
        transport.connect(&token).await.unwrap();
        assert!(transport.is_connected());

        let mut incoming = transport.receive(Version::ZERO);
        let changeset = Changeset::local(
            Version::new(1),
            vec![ObjectChange::put("Dog", "fido", vec![1])],
        )
        .stamped_by(ClientId::generate());
        transport.send(&changeset).await.unwrap();

        let received = incoming.next().await.unwrap().unwrap();
        assert_eq!(received.server_version, Some(Version::new(1)));
        assert_eq!(
            transport.server_high_water_mark().await.unwrap(),
            Version::new(1)
        );

        transport.disconnect().await;
        assert!(incoming.next().await.is_none());
    }

    #[tokio::test]
    async fn revoked_user_is_rejected() {
        let server = Arc::new(SyncServer::default());
        let tokens = AuthorityTokenProvider::new(Arc::clone(&server));
        let token = tokens.acquire_token(&identity("alice")).await.unwrap();
        server.authority().revoke("alice");

        let transport = ServerTransport::new(Arc::clone(&server));
        assert!(matches!(
            transport.connect(&token).await,
            Err(TransportError::TokenRejected(_))
        ));
        assert!(matches!(
            tokens.acquire_token(&identity("alice")).await,
            Err(TokenError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn calls_before_connect_fail_as_network_errors() {
        let transport = ServerTransport::new(Arc::new(SyncServer::default()));
        assert!(matches!(
            transport.server_high_water_mark().await,
            Err(TransportError::Network(_))
        ));
        let mut incoming = transport.receive(Version::ZERO);
        assert!(matches!(
            incoming.next().await,
            Some(Err(TransportError::Network(_)))
        ));
    }
}
