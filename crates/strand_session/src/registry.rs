//! Process-wide map from session identity to the live session.

use crate::config::SyncConfig;
use crate::driver::{SessionCommand, SessionDriver};
use crate::error::{SyncError, SyncResult};
use crate::identity::SessionIdentity;
use crate::session::{SyncSession, SyncSessionRef};
use crate::store::LocalStore;
use crate::token::TokenProvider;
use crate::transport::TransportConnector;
use crate::worker::SyncWorker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strand_protocol::ClientId;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, Instrument};

/// Everything a registry needs to start sessions.
#[derive(Clone)]
pub struct SessionEnvironment {
    config: SyncConfig,
    tokens: Arc<dyn TokenProvider>,
    connector: Arc<dyn TransportConnector>,
    worker: Arc<SyncWorker>,
}

impl SessionEnvironment {
    /// Bundles the collaborators shared by every session.
    pub fn new(
        config: SyncConfig,
        tokens: Arc<dyn TokenProvider>,
        connector: Arc<dyn TransportConnector>,
        worker: Arc<SyncWorker>,
    ) -> Self {
        Self {
            config,
            tokens,
            connector,
            worker,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

struct RegistryEntry {
    session: Arc<SyncSession>,
    opens: usize,
}

/// Guarantees at most one live session per [`SessionIdentity`].
///
/// The registry owns every session. Callers only ever hold
/// [`SyncSessionRef`]s, which stop working once the entry is removed.
/// Each `get_or_create` counts as one open of the store; the session closes
/// when the matching number of `release` calls has been made, or on
/// `remove`.
pub struct SessionRegistry {
    env: SessionEnvironment,
    sessions: Mutex<HashMap<SessionIdentity, RegistryEntry>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(env: SessionEnvironment) -> Self {
        Self {
            env,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the session for `identity`, starting one over `store` if
    /// none is live.
    ///
    /// Concurrent callers with equal identities always get the same
    /// session.
    pub fn get_or_create(
        &self,
        identity: &SessionIdentity,
        store: &Arc<dyn LocalStore>,
    ) -> SyncResult<SyncSessionRef> {
        if store.path() != identity.store_path() {
            return Err(SyncError::InvalidIdentity(format!(
                "store at {} opened for {identity}",
                store.path().display()
            )));
        }

        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions
            .get_mut(identity)
            .filter(|entry| entry.session.is_live())
        {
            entry.opens += 1;
            debug!(session = %identity, opens = entry.opens, "reusing session");
            return Ok(SyncSessionRef::new(&entry.session));
        }
        // Left over when a store was closed directly instead of released
        let stale = sessions
            .remove(identity)
            .map(|entry| retire(entry.session));

        let started = self.start(identity, store);
        let result = started.map(|session| {
            let handle = SyncSessionRef::new(&session);
            sessions.insert(identity.clone(), RegistryEntry { session, opens: 1 });
            info!(session = %identity, "session created");
            handle
        });
        drop(sessions);

        if let Some(session) = stale {
            session.finish_close();
            debug!(session = %identity, "stale session replaced");
        }
        result
    }

    /// Returns the live session for `identity`.
    pub fn get(&self, identity: &SessionIdentity) -> SyncResult<SyncSessionRef> {
        self.sessions
            .lock()
            .get(identity)
            .filter(|entry| entry.session.is_live())
            .map(|entry| SyncSessionRef::new(&entry.session))
            .ok_or_else(|| SyncError::SessionNotFound(identity.to_string()))
    }

    /// Returns true if a live session exists for `identity`.
    pub fn contains(&self, identity: &SessionIdentity) -> bool {
        self.sessions
            .lock()
            .get(identity)
            .is_some_and(|entry| entry.session.is_live())
    }

    /// Drops one open of the store behind `handle`, closing the session
    /// after the last.
    ///
    /// Returns true if the handle's session is gone afterwards. A handle to
    /// a session that was already replaced leaves the successor alone.
    pub fn release(&self, handle: &SyncSessionRef) -> bool {
        let identity = handle.identity();
        let session = {
            let mut sessions = self.sessions.lock();
            let Some(entry) = sessions
                .get_mut(identity)
                .filter(|entry| handle.points_to(&entry.session))
            else {
                return true;
            };
            entry.opens = entry.opens.saturating_sub(1);
            if entry.opens > 0 {
                debug!(session = %identity, opens = entry.opens, "store handle released");
                return false;
            }
            let Some(entry) = sessions.remove(identity) else {
                return true;
            };
            // Retired before the lock is released, so nobody can observe a
            // removed session as live or lose a successor's listener.
            retire(entry.session)
        };
        session.finish_close();
        info!(session = %identity, "session closed");
        true
    }

    /// Closes the session for `identity` regardless of open count.
    pub fn remove(&self, identity: &SessionIdentity) -> bool {
        let session = {
            let mut sessions = self.sessions.lock();
            let Some(entry) = sessions.remove(identity) else {
                return false;
            };
            retire(entry.session)
        };
        session.finish_close();
        info!(session = %identity, "session removed");
        true
    }

    /// Closes every session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let closed: Vec<_> = {
            let mut sessions = self.sessions.lock();
            sessions
                .drain()
                .map(|(_, entry)| retire(entry.session))
                .collect()
        };
        for session in &closed {
            session.finish_close();
        }
        closed.len()
    }

    /// Returns the number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|entry| entry.session.is_live())
            .count()
    }

    /// Returns true if no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds a session and starts its driver on the worker.
    fn start(
        &self,
        identity: &SessionIdentity,
        store: &Arc<dyn LocalStore>,
    ) -> SyncResult<Arc<SyncSession>> {
        let progress = store.load_progress()?;
        let client_id = progress.client.unwrap_or_else(ClientId::generate);
        let transport = self.env.connector.create(identity)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(SyncSession::new(
            identity.clone(),
            Arc::clone(store),
            client_id,
            progress,
            tx.clone(),
        ));
        session.save_progress();

        store.set_commit_listener(Box::new(move |version| {
            let _ = tx.send(SessionCommand::LocalCommit(version));
        }));

        let driver = SessionDriver::new(
            Arc::clone(&session),
            transport,
            Arc::clone(&self.env.tokens),
            &self.env.config,
            rx,
        );
        let span = info_span!(
            "sync_session",
            user = identity.user(),
            store = %identity.store_path().display(),
        );
        if let Err(e) = self.env.worker.spawn(driver.run().instrument(span)) {
            store.clear_commit_listener();
            return Err(e);
        }
        Ok(session)
    }
}

/// Marks a session removed from the map as dead and detaches it from its
/// store. Must run under the registry lock: a successor session for the
/// same store installs its own listener under that lock.
fn retire(session: Arc<SyncSession>) -> Arc<SyncSession> {
    session.mark_closed();
    session.store().clear_commit_listener();
    session
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}
