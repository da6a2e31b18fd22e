//! Local store collaborator contract.

use serde::{Deserialize, Serialize};
use std::path::Path;
use strand_protocol::{Changeset, ClientId, Version};
use thiserror::Error;

/// Result type for local store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a local store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// A remote changeset could not be integrated.
    #[error("failed to integrate changeset: {0}")]
    Integration(String),

    /// Underlying storage failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Callback invoked after every local commit with the new local version.
pub type CommitListener = Box<dyn Fn(Version) + Send + Sync>;

/// Sync bookkeeping a store keeps alongside its data.
///
/// Persisting this lets a reopened store resume without re-uploading or
/// re-applying changesets it already exchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Client id used for changesets this store uploaded.
    pub client: Option<ClientId>,
    /// Highest local version acknowledged by the server.
    pub uploaded: Version,
    /// Highest server version applied to the store.
    pub downloaded: Version,
}

/// A transactional object store kept in sync by a session.
///
/// Implementations must be thread-safe: the calling application commits from
/// its own threads while the sync worker reads pending changesets and applies
/// remote ones.
pub trait LocalStore: Send + Sync {
    /// Returns the path identifying the store.
    fn path(&self) -> &Path;

    /// Returns the version of the latest local commit.
    fn current_version(&self) -> Version;

    /// Returns local commits newer than `after`, in commit order.
    fn changesets_since(&self, after: Version) -> StoreResult<Vec<Changeset>>;

    /// Integrates a remote changeset.
    ///
    /// This is not a local commit: it must not advance `current_version`
    /// or notify the commit listener.
    fn apply_changeset(&self, changeset: &Changeset) -> StoreResult<()>;

    /// Installs the listener notified after each local commit, replacing any
    /// previous one.
    fn set_commit_listener(&self, listener: CommitListener);

    /// Removes the commit listener.
    fn clear_commit_listener(&self);

    /// Loads persisted sync progress.
    fn load_progress(&self) -> StoreResult<SyncProgress>;

    /// Persists sync progress.
    fn save_progress(&self, progress: SyncProgress) -> StoreResult<()>;

    /// Closes the store. Further operations fail with `StoreError::Closed`.
    fn close(&self);

    /// Returns true until the store is closed.
    fn is_open(&self) -> bool;
}
