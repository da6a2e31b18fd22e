//! Interruptible waits on sync progress.
//!
//! A [`WaitHandleManager`] owns the upload and download cursors of one
//! session together with the set of callers blocked on them. Each caller
//! gets its own [`WaitHandle`] with a private slot, so releases are
//! independent: a progress event resolves every satisfied handle and a slow
//! waiter never delays the others.
//!
//! Registration and progress checks happen under the same lock, so a cursor
//! advance that lands before a handle is registered is still observed by it.
//!
//! Waits are aborted cooperatively through a [`CancelSignal`] or a timeout;
//! either way the caller sees [`WaitOutcome::Interrupted`] and the underlying
//! transfer keeps running.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use strand_protocol::Version;

/// Which progress cursor a wait is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local changes acknowledged by the server.
    Upload,
    /// Server changes applied locally.
    Download,
}

/// Why a session stopped accepting waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The user logged out.
    Ending,
    /// The local store was closed.
    Closed,
    /// The token provider rejected the user.
    Authentication(String),
    /// The transport hit an unrecoverable protocol error.
    Protocol(String),
}

/// How a wait resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The cursor reached the target.
    Done,
    /// Cancelled or timed out before the target was reached.
    Interrupted,
    /// The session can no longer make progress.
    Terminated(Termination),
}

/// Identifies a registered wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitId(u64);

/// Single-assignment rendezvous between one waiter and its releasers.
#[derive(Default)]
struct WaitSlot {
    outcome: Mutex<Option<WaitOutcome>>,
    ready: Condvar,
}

impl WaitSlot {
    /// Sets the outcome if none is set yet. Returns true if this call won.
    fn resolve(&self, outcome: WaitOutcome) -> bool {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.ready.notify_all();
        true
    }

    /// Blocks until resolved. Reaching `deadline` resolves as interrupted.
    fn wait(&self, deadline: Option<Instant>) -> WaitOutcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() && slot.is_none() {
                        *slot = Some(WaitOutcome::Interrupted);
                    }
                }
                None => self.ready.wait(&mut slot),
            }
        }
    }
}

/// A cooperative cancellation signal owned by a caller.
///
/// Setting the signal interrupts the wait currently using it, or the next
/// wait started with it if none is in progress. The interrupted wait clears
/// the signal, so it never leaks into later unrelated waits.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    pending: AtomicBool,
    waiters: Mutex<Vec<Weak<WaitSlot>>>,
}

impl CancelSignal {
    /// Creates an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signal and interrupts any wait currently attached to it.
    pub fn cancel(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
        let waiters = self.inner.waiters.lock();
        for slot in waiters.iter().filter_map(Weak::upgrade) {
            slot.resolve(WaitOutcome::Interrupted);
        }
    }

    /// Returns true if the signal is set and not yet consumed.
    pub fn is_cancelled(&self) -> bool {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Clears the signal, returning whether it was set.
    pub fn consume(&self) -> bool {
        self.inner.pending.swap(false, Ordering::SeqCst)
    }

    fn attach(&self, slot: &Arc<WaitSlot>) -> Attachment<'_> {
        let slot = Arc::downgrade(slot);
        self.inner.waiters.lock().push(slot.clone());
        Attachment { signal: self, slot }
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Detaches a slot from its signal when the wait ends.
struct Attachment<'a> {
    signal: &'a CancelSignal,
    slot: Weak<WaitSlot>,
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        self.signal
            .inner
            .waiters
            .lock()
            .retain(|w| !w.ptr_eq(&self.slot) && w.strong_count() > 0);
    }
}

/// Options for a blocking checkpoint call.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    cancel: Option<CancelSignal>,
    timeout: Option<Duration>,
}

impl WaitOptions {
    /// Waits until done, with no cancellation or timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets `signal` interrupt the wait.
    pub fn with_cancel(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Interrupts the wait after `timeout`, as if cancelled at expiry.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the cancellation signal, if any.
    pub fn cancel_signal(&self) -> Option<&CancelSignal> {
        self.cancel.as_ref()
    }

    /// Returns the timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Clears a pending cancellation, returning whether one was pending.
    pub fn consume_cancellation(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelSignal::consume)
    }
}

struct Registration {
    id: WaitId,
    direction: Direction,
    target: Option<Version>,
    slot: Arc<WaitSlot>,
}

struct WaitSet {
    next_id: u64,
    upload: Version,
    download: Version,
    pending: Vec<Registration>,
    terminated: Option<Termination>,
}

impl WaitSet {
    fn cursor(&self, direction: Direction) -> Version {
        match direction {
            Direction::Upload => self.upload,
            Direction::Download => self.download,
        }
    }

    fn cursor_mut(&mut self, direction: Direction) -> &mut Version {
        match direction {
            Direction::Upload => &mut self.upload,
            Direction::Download => &mut self.download,
        }
    }
}

/// Tracks progress cursors and the callers waiting on them.
pub struct WaitHandleManager {
    inner: Mutex<WaitSet>,
}

impl WaitHandleManager {
    /// Creates a manager starting from the given cursors.
    pub fn new(upload: Version, download: Version) -> Self {
        Self {
            inner: Mutex::new(WaitSet {
                next_id: 1,
                upload,
                download,
                pending: Vec::new(),
                terminated: None,
            }),
        }
    }

    /// Returns the current cursor for `direction`.
    pub fn cursor(&self, direction: Direction) -> Version {
        self.inner.lock().cursor(direction)
    }

    /// Registers a wait for `direction` to reach `target`.
    ///
    /// A `None` target stays pending until [`set_target`](Self::set_target)
    /// supplies one. A target the cursor already satisfies resolves at once,
    /// even on a terminated manager.
    pub fn register(&self, direction: Direction, target: Option<Version>) -> WaitHandle<'_> {
        let mut set = self.inner.lock();
        let id = WaitId(set.next_id);
        set.next_id += 1;
        let slot = Arc::new(WaitSlot::default());

        let cursor = set.cursor(direction);
        if target.is_some_and(|t| cursor >= t) {
            slot.resolve(WaitOutcome::Done);
        } else if let Some(termination) = &set.terminated {
            slot.resolve(WaitOutcome::Terminated(termination.clone()));
        } else {
            set.pending.push(Registration {
                id,
                direction,
                target,
                slot: Arc::clone(&slot),
            });
        }

        WaitHandle {
            manager: self,
            id,
            direction,
            slot,
        }
    }

    /// Supplies the target of a pending wait. Returns false if the wait is
    /// no longer registered.
    pub fn set_target(&self, id: WaitId, target: Version) -> bool {
        let mut set = self.inner.lock();
        let Some(pos) = set.pending.iter().position(|r| r.id == id) else {
            return false;
        };
        let cursor = set.cursor(set.pending[pos].direction);
        if cursor >= target {
            let registration = set.pending.swap_remove(pos);
            registration.slot.resolve(WaitOutcome::Done);
        } else {
            set.pending[pos].target = Some(target);
        }
        true
    }

    /// Moves the cursor forward to `version` and releases every wait it
    /// satisfies. Never moves a cursor backwards. Returns the new cursor.
    pub fn advance(&self, direction: Direction, version: Version) -> Version {
        let mut set = self.inner.lock();
        let cursor = set.cursor_mut(direction);
        if version > *cursor {
            *cursor = version;
        }
        let cursor = *cursor;

        set.pending.retain(|r| {
            let satisfied = r.direction == direction && r.target.is_some_and(|t| cursor >= t);
            if satisfied {
                r.slot.resolve(WaitOutcome::Done);
            }
            !satisfied
        });
        cursor
    }

    /// Releases every pending wait with `termination` and makes later
    /// registrations resolve the same way. Returns how many were released.
    ///
    /// The first termination sticks: a close after a fatal error still
    /// reports the fatal cause.
    pub fn terminate(&self, termination: Termination) -> usize {
        let mut set = self.inner.lock();
        let termination = set.terminated.get_or_insert(termination).clone();
        let released = std::mem::take(&mut set.pending);
        for registration in &released {
            registration
                .slot
                .resolve(WaitOutcome::Terminated(termination.clone()));
        }
        released.len()
    }

    /// Returns the termination, if any.
    pub fn termination(&self) -> Option<Termination> {
        self.inner.lock().terminated.clone()
    }

    /// Returns the number of registered, unresolved waits.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn deregister(&self, id: WaitId) {
        self.inner.lock().pending.retain(|r| r.id != id);
    }
}

impl Default for WaitHandleManager {
    fn default() -> Self {
        Self::new(Version::ZERO, Version::ZERO)
    }
}

/// A registered wait. Dropping it deregisters it.
pub struct WaitHandle<'a> {
    manager: &'a WaitHandleManager,
    id: WaitId,
    direction: Direction,
    slot: Arc<WaitSlot>,
}

impl WaitHandle<'_> {
    /// Returns the wait id.
    pub fn id(&self) -> WaitId {
        self.id
    }

    /// Returns the direction waited on.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Blocks until the wait resolves, is cancelled, or times out.
    ///
    /// An interrupted wait consumes the cancellation signal.
    pub fn wait(self, options: &WaitOptions) -> WaitOutcome {
        let cancel = options.cancel_signal();
        let _attachment = cancel.map(|signal| signal.attach(&self.slot));
        if cancel.is_some_and(CancelSignal::is_cancelled) {
            self.slot.resolve(WaitOutcome::Interrupted);
        }

        let deadline = options.timeout().map(|timeout| Instant::now() + timeout);
        let outcome = self.slot.wait(deadline);
        if outcome == WaitOutcome::Interrupted {
            options.consume_cancellation();
        }
        outcome
    }
}

impl Drop for WaitHandle<'_> {
    fn drop(&mut self) {
        self.manager.deregister(self.id);
    }
}
