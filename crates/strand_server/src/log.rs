//! Server-side changeset log.

use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use strand_protocol::{Changeset, ClientId, Version};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Default)]
struct LogState {
    /// Integrated changesets; entry `i` has server version `i + 1`.
    entries: Vec<Changeset>,
    /// Highest local version integrated per client, with its server version.
    integrated: HashMap<ClientId, (Version, Version)>,
}

/// The shared, totally ordered history every client syncs against.
///
/// The log maintains:
/// - All changesets in integration order
/// - The high-water mark (latest server version)
/// - Per-client upload positions, so a re-sent changeset is acknowledged
///   without being integrated twice
/// - A live feed for subscribers
pub struct ChangesetLog {
    state: RwLock<LogState>,
    feed: broadcast::Sender<Changeset>,
}

impl ChangesetLog {
    /// Creates an empty log whose subscribers buffer up to `feed_capacity`
    /// changesets.
    pub fn new(feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            state: RwLock::new(LogState::default()),
            feed,
        }
    }

    /// Returns the latest server version.
    pub fn high_water_mark(&self) -> Version {
        Version::new(self.state.read().entries.len() as u64)
    }

    /// Integrates an uploaded changeset and returns its server version.
    ///
    /// Changesets must carry an origin. A changeset its client already
    /// uploaded returns the version it was integrated at.
    pub fn integrate(&self, changeset: Changeset) -> ServerResult<Version> {
        let origin = changeset
            .origin
            .ok_or_else(|| ServerError::InvalidRequest("changeset has no origin".into()))?;

        let mut state = self.state.write();
        if let Some(&(uploaded, at)) = state.integrated.get(&origin) {
            if changeset.local_version <= uploaded {
                debug!(client = %origin, version = %changeset.local_version, "duplicate upload");
                return Ok(at);
            }
        }

        let server_version = Version::new(state.entries.len() as u64 + 1);
        let changeset = changeset.integrated_at(server_version);
        state.entries.push(changeset.clone());
        state
            .integrated
            .insert(origin, (changeset.local_version, server_version));
        // Sent under the write lock so subscribers see versions in order
        let _ = self.feed.send(changeset);
        debug!(client = %origin, server_version = %server_version, "changeset integrated");
        Ok(server_version)
    }

    /// Returns changesets newer than `after`.
    pub fn changesets_since(&self, after: Version) -> Vec<Changeset> {
        let state = self.state.read();
        let start = usize::try_from(after.get())
            .unwrap_or(usize::MAX)
            .min(state.entries.len());
        state.entries[start..].to_vec()
    }

    /// Opens a subscription delivering every changeset newer than `after`:
    /// first the existing ones, then new ones as they are integrated.
    pub fn subscribe(self: &Arc<Self>, after: Version) -> Subscription {
        // Holding the read lock keeps integration out between the backlog
        // snapshot and the feed subscription.
        let state = self.state.read();
        let live = self.feed.subscribe();
        let start = usize::try_from(after.get())
            .unwrap_or(usize::MAX)
            .min(state.entries.len());
        let backlog = state.entries[start..].iter().cloned().collect();
        drop(state);

        Subscription {
            log: Arc::clone(self),
            backlog,
            live,
            last: after,
        }
    }

    /// Returns the number of changesets.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if nothing has been integrated.
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }
}

impl Default for ChangesetLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// An ordered, gap-free stream of server changesets.
pub struct Subscription {
    log: Arc<ChangesetLog>,
    backlog: VecDeque<Changeset>,
    live: broadcast::Receiver<Changeset>,
    last: Version,
}

impl Subscription {
    /// Returns the next changeset, waiting for one to be integrated.
    pub async fn recv(&mut self) -> Option<Changeset> {
        loop {
            if let Some(changeset) = self.backlog.pop_front() {
                return Some(self.deliver(changeset));
            }
            match self.live.recv().await {
                Ok(changeset) => {
                    if changeset.server_version.is_some_and(|v| v > self.last) {
                        return Some(self.deliver(changeset));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, last = %self.last, "subscriber lagged, catching up from log");
                    self.backlog = self.log.changesets_since(self.last).into();
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the last server version delivered.
    pub fn position(&self) -> Version {
        self.last
    }

    fn deliver(&mut self, changeset: Changeset) -> Changeset {
        if let Some(version) = changeset.server_version {
            self.last = version;
        }
        changeset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_protocol::ObjectChange;

    fn upload(client: ClientId, local: u64) -> Changeset {
        Changeset::local(
            Version::new(local),
            vec![ObjectChange::put("Dog", format!("dog-{local}"), vec![1])],
        )
        .stamped_by(client)
    }

    #[test]
    fn empty_log() {
        let log = ChangesetLog::default();
        assert!(log.is_empty());
        assert_eq!(log.high_water_mark(), Version::ZERO);
        assert!(log.changesets_since(Version::ZERO).is_empty());
    }

    #[test]
    fn integrate_assigns_consecutive_versions() {
        let log = ChangesetLog::default();
        let a = ClientId::generate();
        let b = ClientId::generate();

        assert_eq!(log.integrate(upload(a, 1)).unwrap(), Version::new(1));
        assert_eq!(log.integrate(upload(b, 1)).unwrap(), Version::new(2));
        assert_eq!(log.integrate(upload(a, 2)).unwrap(), Version::new(3));
        assert_eq!(log.high_water_mark(), Version::new(3));

        let since = log.changesets_since(Version::new(1));
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].server_version, Some(Version::new(2)));
        assert!(since[1].is_from(a));
    }

    #[test]
    fn duplicate_upload_is_acknowledged_once() {
        let log = ChangesetLog::default();
        let client = ClientId::generate();

        let first = log.integrate(upload(client, 1)).unwrap();
        let again = log.integrate(upload(client, 1)).unwrap();
        assert_eq!(first, again);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn reject_changeset_without_origin() {
        let log = ChangesetLog::default();
        let anonymous = Changeset::local(Version::new(1), Vec::new());
        assert!(matches!(
            log.integrate(anonymous),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn subscription_replays_backlog_then_follows() {
        let log = Arc::new(ChangesetLog::default());
        let client = ClientId::generate();
        log.integrate(upload(client, 1)).unwrap();
        log.integrate(upload(client, 2)).unwrap();

        let mut subscription = log.subscribe(Version::new(1));
        log.integrate(upload(client, 3)).unwrap();

        let versions = [
            subscription.recv().await.unwrap().server_version,
            subscription.recv().await.unwrap().server_version,
        ];
        assert_eq!(versions, [Some(Version::new(2)), Some(Version::new(3))]);
        assert_eq!(subscription.position(), Version::new(3));
    }

    #[tokio::test]
    async fn lagging_subscriber_catches_up_from_log() {
        let log = Arc::new(ChangesetLog::new(2));
        let client = ClientId::generate();
        let mut subscription = log.subscribe(Version::ZERO);

        for local in 1..=5 {
            log.integrate(upload(client, local)).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let changeset = subscription.recv().await.unwrap();
            seen.push(changeset.server_version.unwrap().get());
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }
}
