//! Sync sessions and the handles callers use to reach them.

use crate::driver::SessionCommand;
use crate::error::{SyncError, SyncResult};
use crate::identity::SessionIdentity;
use crate::state::SessionState;
use crate::store::{LocalStore, SyncProgress};
use crate::wait::{Direction, Termination, WaitHandleManager, WaitOptions, WaitOutcome};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use strand_protocol::{AccessToken, ClientId, Version};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Mutable session fields guarded by the session lock.
struct SessionCore {
    state: SessionState,
    token: Option<AccessToken>,
    last_error: Option<SyncError>,
}

/// One synchronization session, owned by the registry.
///
/// The background driver is the only writer of state, token and cursors.
/// Calling threads read snapshots and talk to the driver through commands.
pub(crate) struct SyncSession {
    identity: SessionIdentity,
    client_id: ClientId,
    store: Arc<dyn LocalStore>,
    live: AtomicBool,
    core: Mutex<SessionCore>,
    state_changed: Condvar,
    waits: WaitHandleManager,
    commands: UnboundedSender<SessionCommand>,
}

impl SyncSession {
    pub(crate) fn new(
        identity: SessionIdentity,
        store: Arc<dyn LocalStore>,
        client_id: ClientId,
        progress: SyncProgress,
        commands: UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            identity,
            client_id,
            store,
            live: AtomicBool::new(true),
            core: Mutex::new(SessionCore {
                state: SessionState::WaitingForAccessToken,
                token: None,
                last_error: None,
            }),
            state_changed: Condvar::new(),
            waits: WaitHandleManager::new(progress.uploaded, progress.downloaded),
            commands,
        }
    }

    pub(crate) fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub(crate) fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub(crate) fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub(crate) fn waits(&self) -> &WaitHandleManager {
        &self.waits
    }

    /// True until the registry drops the session or its store is closed.
    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) && self.store.is_open()
    }

    pub(crate) fn state(&self) -> SessionState {
        self.core.lock().state
    }

    pub(crate) fn token(&self) -> Option<AccessToken> {
        self.core.lock().token.clone()
    }

    pub(crate) fn set_token(&self, token: Option<AccessToken>) {
        self.core.lock().token = token;
    }

    /// Moves to `next`, returning the previous state.
    pub(crate) fn transition(&self, next: SessionState) -> SyncResult<SessionState> {
        let previous = {
            let mut core = self.core.lock();
            let previous = core.state;
            if !previous.can_transition_to(next) {
                return Err(SyncError::InvalidStateTransition {
                    from: previous.to_string(),
                    to: next.to_string(),
                });
            }
            core.state = next;
            previous
        };
        info!(from = %previous, to = %next, "session state changed");
        self.state_changed.notify_all();
        Ok(previous)
    }

    /// Starts logging out unless already past that point.
    pub(crate) fn enter_dying(&self) {
        if self.state().can_transition_to(SessionState::Dying) {
            let _ = self.transition(SessionState::Dying);
        }
    }

    /// Moves to `FatalError`, records the cause and releases every waiter.
    pub(crate) fn fail(&self, termination: Termination) {
        let error = SyncError::from(termination.clone());
        {
            let mut core = self.core.lock();
            if core.state == SessionState::FatalError {
                return;
            }
            core.state = SessionState::FatalError;
            core.token = None;
            core.last_error = Some(error.clone());
        }
        error!(%error, "session failed");
        self.state_changed.notify_all();
        self.waits.terminate(termination);
    }

    /// Persists the current cursors to the store.
    pub(crate) fn save_progress(&self) {
        self.persist(self.progress());
    }

    /// Persists `direction` at `version`, then releases the waits it
    /// satisfies. A released caller always finds the progress durable.
    pub(crate) fn record_progress(&self, direction: Direction, version: Version) {
        let mut progress = self.progress();
        let cursor = match direction {
            Direction::Upload => &mut progress.uploaded,
            Direction::Download => &mut progress.downloaded,
        };
        *cursor = (*cursor).max(version);
        self.persist(progress);
        self.waits.advance(direction, version);
    }

    fn progress(&self) -> SyncProgress {
        SyncProgress {
            client: Some(self.client_id),
            uploaded: self.waits.cursor(Direction::Upload),
            downloaded: self.waits.cursor(Direction::Download),
        }
    }

    fn persist(&self, progress: SyncProgress) {
        if let Err(e) = self.store.save_progress(progress) {
            warn!(error = %e, "failed to persist sync progress");
        }
    }

    /// Sends a command to the driver. Returns false if the driver is gone.
    pub(crate) fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Flags the session as dead. Cheap and lock-free so the registry can
    /// call it while holding its own lock. Returns whether it was live.
    pub(crate) fn mark_closed(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }

    /// Releases waiters and tells the driver to wind down.
    pub(crate) fn finish_close(&self) {
        let released = self.waits.terminate(Termination::Closed);
        self.send(SessionCommand::Close);
        // Take the lock so a concurrent `wait_for_state` cannot miss the wakeup
        drop(self.core.lock());
        self.state_changed.notify_all();
        debug!(released, "session closed");
    }
}

/// A non-owning reference to a sync session.
///
/// Every call first checks that the session is still live; once its local
/// store has been closed, by the registry or directly, all calls fail with
/// [`SyncError::ClosedSession`].
#[derive(Clone)]
pub struct SyncSessionRef {
    inner: Weak<SyncSession>,
    identity: SessionIdentity,
}

impl SyncSessionRef {
    pub(crate) fn new(session: &Arc<SyncSession>) -> Self {
        Self {
            inner: Arc::downgrade(session),
            identity: session.identity().clone(),
        }
    }

    fn live(&self) -> SyncResult<Arc<SyncSession>> {
        let session = self.inner.upgrade().ok_or(SyncError::ClosedSession)?;
        if !session.is_live() {
            return Err(SyncError::ClosedSession);
        }
        Ok(session)
    }

    /// Returns the identity this reference was created for.
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub(crate) fn points_to(&self, session: &Arc<SyncSession>) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(session))
    }

    /// Returns true if both references point at the same session.
    pub fn same_session(&self, other: &SyncSessionRef) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the current state.
    ///
    /// Fails with [`SyncError::ClosedSession`] once the store has closed.
    pub fn state(&self) -> SyncResult<SessionState> {
        Ok(self.live()?.state())
    }

    /// Returns the id stamped on changesets this session uploads.
    pub fn client_id(&self) -> SyncResult<ClientId> {
        Ok(self.live()?.client_id())
    }

    /// Returns the highest local version acknowledged by the server.
    pub fn upload_cursor(&self) -> SyncResult<Version> {
        Ok(self.live()?.waits().cursor(Direction::Upload))
    }

    /// Returns the highest server version applied locally.
    pub fn download_cursor(&self) -> SyncResult<Version> {
        Ok(self.live()?.waits().cursor(Direction::Download))
    }

    /// Returns the error that drove the session to `FatalError`, if any.
    pub fn last_error(&self) -> SyncResult<Option<SyncError>> {
        Ok(self.live()?.core.lock().last_error.clone())
    }

    /// Returns true while the session holds an access token.
    pub fn has_access_token(&self) -> SyncResult<bool> {
        Ok(self.live()?.core.lock().token.is_some())
    }

    /// Returns the number of callers blocked in checkpoint calls.
    pub fn pending_waits(&self) -> SyncResult<usize> {
        Ok(self.live()?.waits().pending_count())
    }

    /// Blocks until every change committed locally before this call has
    /// been acknowledged by the server.
    ///
    /// Returns [`SyncError::Interrupted`] if `options` carries a pending or
    /// newly set cancellation, or its timeout expires. The signal is cleared
    /// and the upload itself continues in the background.
    pub fn upload_all_local_changes(&self, options: &WaitOptions) -> SyncResult<()> {
        let session = self.live()?;
        if options.consume_cancellation() {
            debug!("upload wait cancelled before it started");
            return Err(SyncError::Interrupted);
        }

        let target = session.store().current_version();
        let handle = session.waits().register(Direction::Upload, Some(target));
        session.send(SessionCommand::LocalCommit(target));
        debug!(target = %target, "waiting for upload");
        outcome_to_result(handle.wait(options))
    }

    /// Blocks until every change the server knew of at the time of this call
    /// has been applied locally.
    ///
    /// Cancellation and timeout behave as for
    /// [`upload_all_local_changes`](Self::upload_all_local_changes).
    pub fn download_all_server_changes(&self, options: &WaitOptions) -> SyncResult<()> {
        let session = self.live()?;
        if options.consume_cancellation() {
            debug!("download wait cancelled before it started");
            return Err(SyncError::Interrupted);
        }

        // The driver captures the server's high-water mark for us; callers
        // never touch the transport.
        let handle = session.waits().register(Direction::Download, None);
        if !session.send(SessionCommand::ResolveDownloadTarget(handle.id())) {
            return Err(session
                .waits()
                .termination()
                .map(SyncError::from)
                .unwrap_or(SyncError::ClosedSession));
        }
        debug!("waiting for download");
        outcome_to_result(handle.wait(options))
    }

    /// Logs the session out. The session passes through `Dying` and settles
    /// at `Inactive`; use [`wait_for_state`](Self::wait_for_state) to
    /// observe it.
    pub fn logout(&self) -> SyncResult<()> {
        let session = self.live()?;
        if !session.state().is_terminal() {
            session.send(SessionCommand::Logout);
        }
        Ok(())
    }

    /// Blocks until the session reaches `target` or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout, or as soon as the session settles in
    /// a different terminal state.
    pub fn wait_for_state(&self, target: SessionState, timeout: Duration) -> SyncResult<bool> {
        let session = self.live()?;
        let deadline = Instant::now() + timeout;
        let mut core = session.core.lock();
        loop {
            if !session.is_live() {
                return Err(SyncError::ClosedSession);
            }
            if core.state == target {
                return Ok(true);
            }
            if core.state.is_terminal() {
                return Ok(false);
            }
            if session
                .state_changed
                .wait_until(&mut core, deadline)
                .timed_out()
            {
                return Ok(core.state == target);
            }
        }
    }
}

impl std::fmt::Debug for SyncSessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSessionRef")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

fn outcome_to_result(outcome: WaitOutcome) -> SyncResult<()> {
    match outcome {
        WaitOutcome::Done => Ok(()),
        WaitOutcome::Interrupted => Err(SyncError::Interrupted),
        WaitOutcome::Terminated(termination) => Err(termination.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, StubStore};
    use tokio::sync::mpsc;

    fn session(
        stub: &Arc<StubStore>,
    ) -> (Arc<SyncSession>, mpsc::UnboundedReceiver<SessionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = SyncSession::new(
            testing::identity("/tmp/a.db", "alice"),
            Arc::clone(stub) as Arc<dyn LocalStore>,
            ClientId::generate(),
            SyncProgress::default(),
            tx,
        );
        (Arc::new(session), rx)
    }

    #[test]
    fn progress_is_saved_before_waiters_wake() {
        let stub = StubStore::new("/tmp/a.db");
        let (session, _rx) = session(&stub);
        let handle = session.waits().register(Direction::Upload, Some(Version::new(3)));

        session.record_progress(Direction::Upload, Version::new(3));
        assert_eq!(handle.wait(&WaitOptions::new()), WaitOutcome::Done);
        assert_eq!(stub.load_progress().unwrap().uploaded, Version::new(3));

        session.record_progress(Direction::Upload, Version::new(2));
        let progress = stub.load_progress().unwrap();
        assert_eq!(progress.uploaded, Version::new(3));
        assert_eq!(progress.client, Some(session.client_id()));
    }

    #[test]
    fn handle_fails_once_store_is_closed_directly() {
        let stub = StubStore::new("/tmp/a.db");
        let (session, _rx) = session(&stub);
        let handle = SyncSessionRef::new(&session);
        assert_eq!(handle.state().unwrap(), SessionState::WaitingForAccessToken);

        stub.close();
        assert_eq!(handle.state(), Err(SyncError::ClosedSession));
        assert_eq!(handle.logout(), Err(SyncError::ClosedSession));
        assert_eq!(
            handle.upload_all_local_changes(&WaitOptions::new()),
            Err(SyncError::ClosedSession)
        );
        assert_eq!(
            handle.wait_for_state(SessionState::Active, Duration::from_millis(10)),
            Err(SyncError::ClosedSession)
        );
    }

    #[test]
    fn finish_close_releases_waiters_and_stops_the_driver() {
        let stub = StubStore::new("/tmp/a.db");
        let (session, mut rx) = session(&stub);
        let handle = session.waits().register(Direction::Download, None);

        assert!(session.mark_closed());
        assert!(!session.mark_closed());
        session.finish_close();

        assert_eq!(
            handle.wait(&WaitOptions::new()),
            WaitOutcome::Terminated(Termination::Closed)
        );
        assert!(matches!(rx.try_recv(), Ok(SessionCommand::Close)));
        assert_eq!(
            SyncSessionRef::new(&session).state(),
            Err(SyncError::ClosedSession)
        );
    }

    #[test]
    fn failure_is_recorded_once() {
        let stub = StubStore::new("/tmp/a.db");
        let (session, _rx) = session(&stub);
        session.set_token(Some(AccessToken::new(
            "t",
            "alice",
            std::time::SystemTime::now() + Duration::from_secs(60),
        )));

        session.fail(Termination::Authentication("revoked".into()));
        session.fail(Termination::Protocol("late".into()));

        let handle = SyncSessionRef::new(&session);
        assert_eq!(handle.state().unwrap(), SessionState::FatalError);
        assert!(!handle.has_access_token().unwrap());
        assert_eq!(
            handle.last_error().unwrap(),
            Some(SyncError::AuthenticationFailed("revoked".into()))
        );
        assert_eq!(
            session.waits().termination(),
            Some(Termination::Authentication("revoked".into()))
        );
    }
}
