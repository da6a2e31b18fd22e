//! In-memory object store.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strand_protocol::{Changeset, ObjectChange, Version};
use strand_session::{CommitListener, LocalStore, StoreError, StoreResult, SyncProgress};

#[derive(Default)]
struct StoreData {
    /// (class, object id) -> payload
    objects: BTreeMap<(String, String), Vec<u8>>,
    commits: Vec<Changeset>,
    applied: usize,
    progress: SyncProgress,
}

/// A [`LocalStore`] holding objects in memory.
///
/// The data outlives a handle: [`reopen`](MemoryStore::reopen) returns a
/// fresh open handle over the same objects, commits and sync progress, the
/// way reopening a file-backed store would.
pub struct MemoryStore {
    path: PathBuf,
    data: Arc<Mutex<StoreData>>,
    open: AtomicBool,
    listener: Mutex<Option<CommitListener>>,
}

impl MemoryStore {
    /// Creates an empty store identified by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: Arc::new(Mutex::new(StoreData::default())),
            open: AtomicBool::new(true),
            listener: Mutex::new(None),
        }
    }

    /// Opens a new handle over this store's data.
    pub fn reopen(&self) -> Self {
        Self {
            path: self.path.clone(),
            data: Arc::clone(&self.data),
            open: AtomicBool::new(true),
            listener: Mutex::new(None),
        }
    }

    /// Commits `changes` as one local transaction and returns its version.
    pub fn commit(&self, changes: Vec<ObjectChange>) -> StoreResult<Version> {
        self.ensure_open()?;
        let version = {
            let mut data = self.data.lock();
            let version = Version::new(data.commits.len() as u64 + 1);
            apply(&mut data.objects, &changes);
            data.commits.push(Changeset::local(version, changes));
            version
        };
        if let Some(listener) = self.listener.lock().as_ref() {
            listener(version);
        }
        Ok(version)
    }

    /// Commits a single put.
    pub fn put(&self, class: &str, object_id: &str, payload: Vec<u8>) -> StoreResult<Version> {
        self.commit(vec![ObjectChange::put(class, object_id, payload)])
    }

    /// Commits a single delete.
    pub fn delete(&self, class: &str, object_id: &str) -> StoreResult<Version> {
        self.commit(vec![ObjectChange::delete(class, object_id)])
    }

    /// Returns an object's payload.
    pub fn get(&self, class: &str, object_id: &str) -> Option<Vec<u8>> {
        self.data
            .lock()
            .objects
            .get(&(class.to_string(), object_id.to_string()))
            .cloned()
    }

    /// Returns the number of objects of `class`.
    pub fn count(&self, class: &str) -> usize {
        self.data
            .lock()
            .objects
            .keys()
            .filter(|(c, _)| c == class)
            .count()
    }

    /// Returns the number of remote changesets integrated.
    pub fn applied_count(&self) -> usize {
        self.data.lock().applied
    }

    /// Returns true while a commit listener is installed on this handle.
    pub fn has_commit_listener(&self) -> bool {
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

impl LocalStore for MemoryStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn current_version(&self) -> Version {
        Version::new(self.data.lock().commits.len() as u64)
    }

    fn changesets_since(&self, after: Version) -> StoreResult<Vec<Changeset>> {
        self.ensure_open()?;
        let data = self.data.lock();
        let start = usize::try_from(after.get())
            .unwrap_or(usize::MAX)
            .min(data.commits.len());
        Ok(data.commits[start..].to_vec())
    }

    fn apply_changeset(&self, changeset: &Changeset) -> StoreResult<()> {
        self.ensure_open()?;
        let mut data = self.data.lock();
        apply(&mut data.objects, &changeset.changes);
        data.applied += 1;
        Ok(())
    }

    fn set_commit_listener(&self, listener: CommitListener) {
        *self.listener.lock() = Some(listener);
    }

    fn clear_commit_listener(&self) {
        self.listener.lock().take();
    }

    fn load_progress(&self) -> StoreResult<SyncProgress> {
        self.ensure_open()?;
        Ok(self.data.lock().progress)
    }

    fn save_progress(&self, progress: SyncProgress) -> StoreResult<()> {
        self.ensure_open()?;
        self.data.lock().progress = progress;
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.clear_commit_listener();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

fn apply(objects: &mut BTreeMap<(String, String), Vec<u8>>, changes: &[ObjectChange]) {
    for change in changes {
        let key = (change.class().to_string(), change.object_id().to_string());
        match change {
            ObjectChange::Put { payload, .. } => {
                objects.insert(key, payload.clone());
            }
            ObjectChange::Delete { .. } => {
                objects.remove(&key);
            }
        }
    }
}
