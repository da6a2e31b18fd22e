//! Application-facing entry point.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::identity::SessionIdentity;
use crate::registry::{SessionEnvironment, SessionRegistry};
use crate::session::SyncSessionRef;
use crate::store::LocalStore;
use crate::token::TokenProvider;
use crate::transport::TransportConnector;
use crate::worker::SyncWorker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::info;

/// Owns the sync worker and the session registry.
///
/// # Example
///
/// ```rust,ignore
/// let manager = SyncManager::new(SyncConfig::default(), tokens, connector)?;
/// let synced = manager.open(identity, store)?;
/// synced.session().upload_all_local_changes(&WaitOptions::new())?;
/// synced.close();
/// ```
pub struct SyncManager {
    registry: Arc<SessionRegistry>,
    worker: Arc<SyncWorker>,
}

impl SyncManager {
    /// Starts the worker thread and an empty registry.
    pub fn new(
        config: SyncConfig,
        tokens: Arc<dyn TokenProvider>,
        connector: Arc<dyn TransportConnector>,
    ) -> SyncResult<Self> {
        let worker = Arc::new(SyncWorker::start(
            &config.worker_thread_name,
            config.drain_timeout * 2,
        )?);
        let env = SessionEnvironment::new(config, tokens, connector, Arc::clone(&worker));
        Ok(Self {
            registry: Arc::new(SessionRegistry::new(env)),
            worker,
        })
    }

    /// Opens `store` for syncing as `identity`.
    ///
    /// Opening the same identity again shares the session; it closes when
    /// every returned [`SyncedStore`] has been closed.
    pub fn open(
        &self,
        identity: SessionIdentity,
        store: Arc<dyn LocalStore>,
    ) -> SyncResult<SyncedStore> {
        let session = self.registry.get_or_create(&identity, &store)?;
        Ok(SyncedStore {
            identity,
            store,
            session,
            registry: Arc::downgrade(&self.registry),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the live session for `identity`.
    pub fn get_session(&self, identity: &SessionIdentity) -> SyncResult<SyncSessionRef> {
        self.registry.get(identity)
    }

    /// Returns the number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Closes every session and stops the worker.
    pub fn shutdown(&self) {
        if !self.worker.is_running() {
            return;
        }
        let closed = self.registry.close_all();
        self.worker.shutdown();
        info!(closed, "sync manager shut down");
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("registry", &self.registry)
            .field("worker", &self.worker)
            .finish()
    }
}

/// A local store opened for syncing.
///
/// Closing it, explicitly or on drop, releases its session. The store
/// itself is closed once no other `SyncedStore` shares the session.
pub struct SyncedStore {
    identity: SessionIdentity,
    store: Arc<dyn LocalStore>,
    session: SyncSessionRef,
    registry: Weak<SessionRegistry>,
    closed: AtomicBool,
}

impl SyncedStore {
    /// Returns the session syncing this store.
    pub fn session(&self) -> &SyncSessionRef {
        &self.session
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Returns the identity the store was opened with.
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Releases the session, closing the store if this was its last user.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let last = match self.registry.upgrade() {
            Some(registry) => registry.release(&self.session),
            None => true,
        };
        if last {
            self.store.close();
        }
    }
}

impl Drop for SyncedStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SyncedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedStore")
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
