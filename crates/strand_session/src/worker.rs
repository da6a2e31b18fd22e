//! Background worker that runs session drivers.
//!
//! One dedicated thread hosts a single-threaded tokio runtime. Every session
//! of a manager runs on it, so no network or token I/O ever happens on the
//! threads that call into the session API.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::future::Future;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Owns the sync thread and tracks the tasks spawned onto it.
pub struct SyncWorker {
    handle: Handle,
    tracker: TaskTracker,
    stop: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SyncWorker {
    /// Starts the worker thread.
    ///
    /// On shutdown, running tasks get `grace` to finish before they are
    /// dropped.
    pub fn start(name: &str, grace: Duration) -> SyncResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SyncError::WorkerUnavailable(format!("failed to build runtime: {e}")))?;
        let handle = runtime.handle().clone();
        let tracker = TaskTracker::new();
        let stop = CancellationToken::new();

        let thread_tracker = tracker.clone();
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    thread_stop.cancelled().await;
                    thread_tracker.close();
                    if tokio::time::timeout(grace, thread_tracker.wait())
                        .await
                        .is_err()
                    {
                        warn!(
                            remaining = thread_tracker.len(),
                            "sync tasks still running at shutdown"
                        );
                    }
                });
                debug!("sync worker stopped");
            })
            .map_err(|e| SyncError::WorkerUnavailable(format!("failed to spawn thread: {e}")))?;

        info!(thread = name, "sync worker started");
        Ok(Self {
            handle,
            tracker,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Spawns a task onto the worker.
    pub fn spawn<F>(&self, future: F) -> SyncResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.stop.is_cancelled() {
            return Err(SyncError::WorkerUnavailable("worker has shut down".into()));
        }
        self.handle.spawn(self.tracker.track_future(future));
        Ok(())
    }

    /// Returns true until shutdown starts.
    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Returns the number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Stops accepting tasks, waits for running ones and joins the thread.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.stop.cancel();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("sync worker thread panicked");
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("running", &self.is_running())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};

    fn worker() -> SyncWorker {
        SyncWorker::start("strand-test", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn runs_tasks_off_the_calling_thread() {
        let worker = worker();
        let (tx, rx) = mpsc::channel();
        worker
            .spawn(async move {
                let name = std::thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            })
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("strand-test"));
    }

    #[test]
    fn shutdown_lets_running_tasks_finish() {
        let worker = worker();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        worker
            .spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        worker.shutdown();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(worker.active_tasks(), 0);
    }

    #[test]
    fn spawn_after_shutdown_fails() {
        let worker = worker();
        worker.shutdown();
        worker.shutdown();

        assert!(!worker.is_running());
        let result = worker.spawn(async {});
        assert!(matches!(result, Err(SyncError::WorkerUnavailable(_))));
    }
}
