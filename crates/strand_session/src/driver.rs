//! The async state machine behind each session.
//!
//! A driver runs on the sync worker and is the only task that touches the
//! token provider and the transport. It owns the session's progress: it
//! uploads local commits, integrates server changesets, advances the wait
//! cursors and persists them. Calling threads reach it through
//! [`SessionCommand`]s, which it serves even while an operation is in
//! flight, so a logout or close is never stuck behind a slow network call.

use crate::config::{RetryConfig, SyncConfig};
use crate::session::SyncSession;
use crate::state::SessionState;
use crate::store::StoreError;
use crate::token::{TokenError, TokenProvider};
use crate::transport::{ChangesetStream, ChangesetTransport, TransportError, TransportResult};
use crate::wait::{Direction, Termination, WaitId};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strand_protocol::{AccessToken, Changeset, Version};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace, warn};

/// Requests sent to a driver by the threads using its session.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// The store committed a new local version.
    LocalCommit(Version),
    /// A download wait needs the server's current high-water mark.
    ResolveDownloadTarget(WaitId),
    /// Log the user out.
    Logout,
    /// The store was closed.
    Close,
}

/// Why a driver stops.
#[derive(Debug)]
enum End {
    Logout,
    Close,
    Fatal(Termination),
}

/// Why a driver leaves the active loop.
#[derive(Debug)]
enum Interrupt {
    /// The connection dropped; reconnect with the current token.
    Reconnect,
    /// The token expired or was rejected; obtain a new one.
    Reauthenticate,
    End(End),
}

impl From<End> for Interrupt {
    fn from(end: End) -> Self {
        Interrupt::End(end)
    }
}

/// Incoming commands, plus the work they requested that is not done yet.
struct Inbox {
    session: Arc<SyncSession>,
    rx: UnboundedReceiver<SessionCommand>,
    upload_requested: bool,
    pending_targets: Vec<WaitId>,
    drain_timeout: Duration,
    /// An end that arrived while an operation drained to completion.
    ending: Option<End>,
}

impl Inbox {
    /// Records a command. Returns the end it asks for, if any.
    fn absorb(&mut self, command: Option<SessionCommand>) -> Option<End> {
        match command {
            Some(SessionCommand::LocalCommit(version)) => {
                trace!(version = %version, "local commit");
                self.upload_requested = true;
                None
            }
            Some(SessionCommand::ResolveDownloadTarget(id)) => {
                self.pending_targets.push(id);
                None
            }
            Some(SessionCommand::Logout) => Some(End::Logout),
            // Every sender is gone: nobody can reach this session any more.
            Some(SessionCommand::Close) | None => Some(End::Close),
        }
    }

    /// Runs `operation` to completion while serving commands.
    ///
    /// A logout or close moves the session to `Dying` and gives the operation
    /// up to the drain timeout to finish. If it does, its output is returned
    /// so the caller can record it, and the end is held back for
    /// [`take_ending`](Self::take_ending); otherwise the session ends now.
    async fn race<F: Future>(&mut self, operation: F) -> Result<F::Output, End> {
        self.serve(operation, true).await
    }

    /// Sleeps while serving commands. Ends early on logout or close.
    async fn sleep(&mut self, delay: Duration) -> Result<(), End> {
        self.serve(tokio::time::sleep(delay), false).await
    }

    /// Returns the end held back by a drained operation, if any.
    fn take_ending(&mut self) -> Option<End> {
        self.ending.take()
    }

    async fn serve<F: Future>(&mut self, operation: F, drain: bool) -> Result<F::Output, End> {
        if let Some(end) = self.take_ending() {
            return Err(end);
        }
        tokio::pin!(operation);
        loop {
            let command = tokio::select! {
                output = &mut operation => return Ok(output),
                command = self.rx.recv() => command,
            };
            if let Some(end) = self.absorb(command) {
                self.session.enter_dying();
                if !drain {
                    return Err(end);
                }
                return match tokio::time::timeout(self.drain_timeout, &mut operation).await {
                    Ok(output) => {
                        self.ending = Some(end);
                        Ok(output)
                    }
                    Err(_) => {
                        warn!(timeout = ?self.drain_timeout, "abandoning in-flight operation");
                        Err(end)
                    }
                };
            }
        }
    }
}

/// Drives one session from login to its terminal state.
pub(crate) struct SessionDriver {
    session: Arc<SyncSession>,
    transport: Arc<dyn ChangesetTransport>,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryConfig,
    refresh_margin: Duration,
    drain_timeout: Duration,
    inbox: Inbox,
    incoming: Option<ChangesetStream>,
}

impl SessionDriver {
    pub(crate) fn new(
        session: Arc<SyncSession>,
        transport: Arc<dyn ChangesetTransport>,
        tokens: Arc<dyn TokenProvider>,
        config: &SyncConfig,
        rx: UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let inbox = Inbox {
            session: Arc::clone(&session),
            rx,
            upload_requested: false,
            pending_targets: Vec::new(),
            drain_timeout: config.drain_timeout,
            ending: None,
        };
        Self {
            session,
            transport,
            tokens,
            retry: config.retry.clone(),
            refresh_margin: config.refresh_margin,
            drain_timeout: config.drain_timeout,
            inbox,
            incoming: None,
        }
    }

    /// Runs the session until it logs out, closes or fails.
    pub(crate) async fn run(mut self) {
        info!(client = %self.session.client_id(), "session driver started");
        let end = self.drive().await;
        self.finish(end).await;
    }

    async fn drive(&mut self) -> End {
        let mut replace_token = false;
        loop {
            let token = match self.obtain_token(replace_token).await {
                Ok(token) => token,
                Err(end) => return end,
            };
            replace_token = false;

            match self.establish(&token).await {
                Ok(()) => {}
                Err(Interrupt::Reauthenticate) => {
                    replace_token = true;
                    continue;
                }
                Err(Interrupt::Reconnect) => continue,
                Err(Interrupt::End(end)) => return end,
            }
            if let Some(end) = self.inbox.take_ending() {
                return end;
            }
            if let Err(e) = self.session.transition(SessionState::Active) {
                return End::Fatal(Termination::Protocol(e.to_string()));
            }

            loop {
                let interrupt = match self.run_active().await {
                    Interrupt::Reconnect => match self.reconnect(&token).await {
                        Ok(()) => continue,
                        Err(interrupt) => interrupt,
                    },
                    interrupt => interrupt,
                };
                if let Some(end) = self.inbox.take_ending() {
                    return end;
                }
                match interrupt {
                    Interrupt::End(end) => return end,
                    Interrupt::Reauthenticate | Interrupt::Reconnect => {
                        if let Err(e) = self
                            .session
                            .transition(SessionState::WaitingForAccessToken)
                        {
                            return End::Fatal(Termination::Protocol(e.to_string()));
                        }
                        replace_token = true;
                        break;
                    }
                }
            }
        }
    }

    /// Returns a usable token, asking the provider when there is none or
    /// `replace` is set. Network failures are retried with backoff.
    async fn obtain_token(&mut self, replace: bool) -> Result<AccessToken, End> {
        let mut attempt = 0u32;
        loop {
            let response = match self.session.token() {
                Some(token) if !replace && !token.is_expired() => return Ok(token),
                Some(token) => {
                    debug!("refreshing access token");
                    self.inbox
                        .race(self.tokens.refresh(self.session.identity(), &token))
                        .await?
                }
                None => {
                    debug!("requesting access token");
                    self.inbox
                        .race(self.tokens.acquire_token(self.session.identity()))
                        .await?
                }
            };

            match response {
                Ok(token) => {
                    info!(expires_in = ?token.time_to_expiry(), "access token obtained");
                    self.session.set_token(Some(token.clone()));
                    return Ok(token);
                }
                Err(TokenError::Rejected(message)) => {
                    return Err(End::Fatal(Termination::Authentication(message)));
                }
                Err(TokenError::Network(message)) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, %message, "token request failed, retrying");
                    self.inbox.sleep(delay).await?;
                }
            }
        }
    }

    /// Connects with `token`, retrying network failures with backoff.
    async fn establish(&mut self, token: &AccessToken) -> Result<(), Interrupt> {
        let mut attempt = 0u32;
        loop {
            match self.inbox.race(self.transport.connect(token)).await? {
                Ok(()) => {
                    debug!("connected");
                    return Ok(());
                }
                Err(TransportError::Network(message)) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, %message, "connect failed, retrying");
                    self.inbox.sleep(delay).await?;
                }
                Err(TransportError::TokenRejected(message)) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(?delay, %message, "server rejected access token");
                    self.inbox.sleep(delay).await?;
                    return Err(Interrupt::Reauthenticate);
                }
                Err(TransportError::Protocol(message)) => {
                    return Err(End::Fatal(Termination::Protocol(message)).into());
                }
            }
        }
    }

    /// Re-establishes a dropped connection without leaving `Active`.
    async fn reconnect(&mut self, token: &AccessToken) -> Result<(), Interrupt> {
        self.incoming = None;
        let delay = self.retry.delay_for_attempt(1);
        self.inbox.sleep(delay).await?;
        self.establish(token).await
    }

    /// Exchanges changes until the connection or the session needs attention.
    async fn run_active(&mut self) -> Interrupt {
        let Some(token) = self.session.token() else {
            return Interrupt::Reauthenticate;
        };
        let refresh = tokio::time::sleep(refresh_delay(token.time_to_expiry(), self.refresh_margin));
        tokio::pin!(refresh);

        if self.incoming.is_none() {
            let after = self.session.waits().cursor(Direction::Download);
            debug!(after = %after, "opening changeset stream");
            self.incoming = Some(self.transport.receive(after));
        }
        // Commits made while disconnected produced no listener work we acted on
        self.inbox.upload_requested = true;

        loop {
            if let Err(interrupt) = self.flush_requests().await {
                return interrupt;
            }
            if let Some(end) = self.inbox.take_ending() {
                return end.into();
            }
            let Some(incoming) = self.incoming.as_mut() else {
                return Interrupt::Reconnect;
            };

            let event = tokio::select! {
                _ = &mut refresh => Event::RefreshDue,
                command = self.inbox.rx.recv() => Event::Command(command),
                item = incoming.next() => Event::Incoming(item),
            };

            match event {
                Event::RefreshDue => {
                    info!("access token nearing expiry");
                    return Interrupt::Reauthenticate;
                }
                Event::Command(command) => {
                    if let Some(end) = self.inbox.absorb(command) {
                        self.session.enter_dying();
                        return end.into();
                    }
                }
                Event::Incoming(Some(Ok(changeset))) => {
                    if let Err(interrupt) = self.integrate(changeset) {
                        return interrupt;
                    }
                }
                Event::Incoming(Some(Err(error))) => {
                    self.incoming = None;
                    return match error {
                        TransportError::Network(message) => {
                            warn!(%message, "changeset stream failed");
                            Interrupt::Reconnect
                        }
                        TransportError::TokenRejected(message) => {
                            warn!(%message, "server rejected access token");
                            Interrupt::Reauthenticate
                        }
                        TransportError::Protocol(message) => {
                            End::Fatal(Termination::Protocol(message)).into()
                        }
                    };
                }
                Event::Incoming(None) => {
                    warn!("changeset stream closed by server");
                    self.incoming = None;
                    return Interrupt::Reconnect;
                }
            }
        }
    }

    /// Performs the uploads and target captures requested so far.
    async fn flush_requests(&mut self) -> Result<(), Interrupt> {
        if !self.inbox.pending_targets.is_empty() {
            self.resolve_download_targets().await?;
        }
        if std::mem::take(&mut self.inbox.upload_requested) {
            self.upload_pending().await?;
        }
        Ok(())
    }

    /// Sets the target of every queued download wait to the server's
    /// current high-water mark.
    async fn resolve_download_targets(&mut self) -> Result<(), Interrupt> {
        // Waits queued while the query runs need a later mark
        let mut waiting = std::mem::take(&mut self.inbox.pending_targets);
        let transport = Arc::clone(&self.transport);
        let mark = match self
            .with_retry("high-water mark", || transport.server_high_water_mark())
            .await
        {
            Ok(mark) => mark,
            Err(interrupt) => {
                // Still unresolved: ask again once the session recovers
                waiting.append(&mut self.inbox.pending_targets);
                self.inbox.pending_targets = waiting;
                return Err(interrupt);
            }
        };
        for id in waiting {
            self.session.waits().set_target(id, mark);
        }
        debug!(mark = %mark, "download targets resolved");
        Ok(())
    }

    /// Uploads every local commit past the upload cursor, in order.
    async fn upload_pending(&mut self) -> Result<(), Interrupt> {
        loop {
            let after = self.session.waits().cursor(Direction::Upload);
            let batch = self
                .session
                .store()
                .changesets_since(after)
                .map_err(store_failure)?;
            if batch.is_empty() {
                return Ok(());
            }

            let transport = Arc::clone(&self.transport);
            for changeset in batch {
                let version = changeset.local_version;
                let changeset = changeset.stamped_by(self.session.client_id());
                self.with_retry("upload", || transport.send(&changeset))
                    .await?;
                self.session.record_progress(Direction::Upload, version);
                debug!(version = %version, changes = changeset.len(), "changeset uploaded");
            }
        }
    }

    /// Applies one server changeset and advances the download cursor.
    fn integrate(&mut self, changeset: Changeset) -> Result<(), Interrupt> {
        let Some(server_version) = changeset.server_version else {
            return Err(End::Fatal(Termination::Protocol(
                "server sent a changeset without a server version".into(),
            ))
            .into());
        };
        if server_version <= self.session.waits().cursor(Direction::Download) {
            trace!(version = %server_version, "skipping changeset already applied");
            return Ok(());
        }

        // Our own commits are already in the store
        if !changeset.is_from(self.session.client_id()) {
            self.session
                .store()
                .apply_changeset(&changeset)
                .map_err(store_failure)?;
        }
        self.session.record_progress(Direction::Download, server_version);
        debug!(version = %server_version, changes = changeset.len(), "changeset integrated");
        Ok(())
    }

    /// Runs a transport call, retrying network failures with backoff.
    async fn with_retry<T, F, Fut>(&mut self, operation: &str, mut call: F) -> Result<T, Interrupt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match self.inbox.race(call()).await? {
                Ok(value) => return Ok(value),
                Err(TransportError::Network(message)) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(operation, attempt, ?delay, %message, "transport call failed, retrying");
                    self.inbox.sleep(delay).await?;
                }
                Err(TransportError::TokenRejected(message)) => {
                    warn!(operation, %message, "server rejected access token");
                    return Err(Interrupt::Reauthenticate);
                }
                Err(TransportError::Protocol(message)) => {
                    return Err(End::Fatal(Termination::Protocol(message)).into());
                }
            }
        }
    }

    /// Settles the session in its terminal state.
    ///
    /// The commit listener is left to the registry, which detaches it under
    /// its lock; a successor session may already own the store's listener.
    async fn finish(mut self, end: End) {
        let termination = match end {
            End::Fatal(termination) => {
                self.session.fail(termination);
                None
            }
            End::Logout => Some(Termination::Ending),
            End::Close => Some(Termination::Closed),
        };
        match termination {
            Some(termination) => {
                self.session.enter_dying();
                let released = self.session.waits().terminate(termination);
                self.disconnect().await;
                self.session.set_token(None);
                if self.session.transition(SessionState::Inactive).is_ok() {
                    info!(released, "session logged out");
                }
            }
            None => self.disconnect().await,
        }
        debug!("session driver stopped");
    }

    async fn disconnect(&mut self) {
        self.incoming = None;
        if tokio::time::timeout(self.drain_timeout, self.transport.disconnect())
            .await
            .is_err()
        {
            warn!("transport did not disconnect in time");
        }
    }
}

enum Event {
    RefreshDue,
    Command(Option<SessionCommand>),
    Incoming(Option<TransportResult<Changeset>>),
}

/// Maps a store failure to how the driver reacts to it.
fn store_failure(error: StoreError) -> Interrupt {
    match error {
        StoreError::Closed => End::Close.into(),
        other => End::Fatal(Termination::Protocol(format!("local store: {other}"))).into(),
    }
}

/// Time until a token with `remaining` lifetime should be refreshed.
///
/// Refreshes `margin` before expiry, but never sooner than halfway through
/// the remaining lifetime, so short-lived tokens do not cause a refresh loop.
fn refresh_delay(remaining: Duration, margin: Duration) -> Duration {
    remaining.saturating_sub(margin).max(remaining / 2)
}
