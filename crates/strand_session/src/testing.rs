//! Minimal collaborators for unit tests inside this crate.

use crate::config::{RetryConfig, SyncConfig};
use crate::error::SyncResult;
use crate::identity::SessionIdentity;
use crate::registry::{SessionEnvironment, SessionRegistry};
use crate::store::{CommitListener, LocalStore, StoreError, StoreResult, SyncProgress};
use crate::token::{TokenError, TokenProvider};
use crate::transport::{
    ChangesetStream, ChangesetTransport, TransportConnector, TransportResult,
};
use crate::worker::SyncWorker;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use strand_protocol::{AccessToken, Changeset, Version};

pub(crate) const SERVER: &str = "strand://unit";

/// A store with no local commits that claims to be at `version`.
///
/// Upload waits for any version above zero never complete, which keeps a
/// caller blocked until the session terminates.
pub(crate) struct StubStore {
    path: PathBuf,
    version: Version,
    open: AtomicBool,
    listener: Mutex<Option<CommitListener>>,
    progress: Mutex<SyncProgress>,
}

impl StubStore {
    pub(crate) fn new(path: &str) -> Arc<Self> {
        Self::at_version(path, Version::ZERO)
    }

    pub(crate) fn at_version(path: &str, version: Version) -> Arc<Self> {
        Arc::new(Self {
            path: PathBuf::from(path),
            version,
            open: AtomicBool::new(true),
            listener: Mutex::new(None),
            progress: Mutex::new(SyncProgress::default()),
        })
    }

    pub(crate) fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }
}

impl LocalStore for StubStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn current_version(&self) -> Version {
        self.version
    }

    fn changesets_since(&self, _after: Version) -> StoreResult<Vec<Changeset>> {
        self.ensure_open()?;
        Ok(Vec::new())
    }

    fn apply_changeset(&self, _changeset: &Changeset) -> StoreResult<()> {
        self.ensure_open()
    }

    fn set_commit_listener(&self, listener: CommitListener) {
        *self.listener.lock() = Some(listener);
    }

    fn clear_commit_listener(&self) {
        self.listener.lock().take();
    }

    fn load_progress(&self) -> StoreResult<SyncProgress> {
        self.ensure_open()?;
        Ok(*self.progress.lock())
    }

    fn save_progress(&self, progress: SyncProgress) -> StoreResult<()> {
        self.ensure_open()?;
        *self.progress.lock() = progress;
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Issues hour-long tokens to everyone.
pub(crate) struct StubTokens;

#[async_trait]
impl TokenProvider for StubTokens {
    async fn acquire_token(&self, identity: &SessionIdentity) -> Result<AccessToken, TokenError> {
        Ok(AccessToken::new(
            "stub-token",
            identity.user(),
            SystemTime::now() + Duration::from_secs(3600),
        ))
    }

    async fn refresh(
        &self,
        identity: &SessionIdentity,
        _token: &AccessToken,
    ) -> Result<AccessToken, TokenError> {
        self.acquire_token(identity).await
    }
}

/// Accepts everything and never delivers a changeset.
pub(crate) struct IdleTransport;

#[async_trait]
impl ChangesetTransport for IdleTransport {
    async fn connect(&self, _token: &AccessToken) -> TransportResult<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn send(&self, _changeset: &Changeset) -> TransportResult<()> {
        Ok(())
    }

    fn receive(&self, _after: Version) -> ChangesetStream {
        futures::stream::pending().boxed()
    }

    async fn server_high_water_mark(&self) -> TransportResult<Version> {
        Ok(Version::ZERO)
    }
}

pub(crate) struct IdleConnector;

impl TransportConnector for IdleConnector {
    fn create(&self, _identity: &SessionIdentity) -> SyncResult<Arc<dyn ChangesetTransport>> {
        Ok(Arc::new(IdleTransport))
    }
}

pub(crate) fn config() -> SyncConfig {
    SyncConfig::new()
        .with_retry(RetryConfig::immediate())
        .with_drain_timeout(Duration::from_millis(200))
        .with_worker_thread_name("strand-unit")
}

pub(crate) fn worker() -> Arc<SyncWorker> {
    Arc::new(SyncWorker::start("strand-unit", Duration::from_secs(1)).unwrap())
}

pub(crate) fn registry_on(worker: &Arc<SyncWorker>) -> SessionRegistry {
    SessionRegistry::new(SessionEnvironment::new(
        config(),
        Arc::new(StubTokens),
        Arc::new(IdleConnector),
        Arc::clone(worker),
    ))
}

pub(crate) fn registry() -> SessionRegistry {
    registry_on(&worker())
}

pub(crate) fn identity(path: &str, user: &str) -> SessionIdentity {
    SessionIdentity::new(path, SERVER, user)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub(crate) fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
