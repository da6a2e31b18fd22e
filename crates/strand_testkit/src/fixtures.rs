//! Test fixtures and session helpers.
//!
//! Provides a ready-made server, token provider, connector and manager so a
//! test can open synced stores in one line.

use crate::faults::FaultPlan;
use crate::store::MemoryStore;
use crate::transport::{AuthorityTokenProvider, ServerConnector};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_server::{ServerConfig, SyncServer};
use strand_session::{
    LocalStore, RetryConfig, SessionIdentity, SyncConfig, SyncManager, SyncedStore, WaitOptions,
};
use tracing_subscriber::EnvFilter;

/// Server URL used by fixture identities.
pub const SERVER_URL: &str = "strand://test-server";

/// Upper bound for any blocking call in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Installs a `RUST_LOG`-driven subscriber that writes through the test
/// harness. Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Session configuration tuned for tests: fast retries, short drains.
pub fn test_config() -> SyncConfig {
    SyncConfig::new()
        .with_retry(RetryConfig::immediate())
        .with_drain_timeout(Duration::from_millis(500))
        .with_worker_thread_name("strand-test")
}

/// Wait options bounded by [`TEST_TIMEOUT`].
pub fn wait_options() -> WaitOptions {
    WaitOptions::new().with_timeout(TEST_TIMEOUT)
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// For conditions nothing signals, such as a waiter having registered.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// A server plus a manager connected to it.
pub struct SyncFixture {
    /// The in-process server.
    pub server: Arc<SyncServer>,
    /// Token provider backed by the server's authority.
    pub tokens: Arc<AuthorityTokenProvider>,
    /// Failures injected into tokens and transports.
    pub faults: Arc<FaultPlan>,
    /// Connector handed to the manager.
    pub connector: Arc<ServerConnector>,
    /// The manager under test.
    pub manager: SyncManager,
}

impl SyncFixture {
    /// Creates a fixture with [`test_config`] and a default server.
    pub fn new() -> Self {
        Self::with_config(test_config(), ServerConfig::default())
    }

    /// Creates a fixture with the given configurations.
    pub fn with_config(config: SyncConfig, server_config: ServerConfig) -> Self {
        init_tracing();
        let server = Arc::new(SyncServer::new(server_config));
        let faults = FaultPlan::new();
        let tokens = Arc::new(
            AuthorityTokenProvider::new(Arc::clone(&server)).with_faults(Arc::clone(&faults)),
        );
        let connector =
            Arc::new(ServerConnector::new(Arc::clone(&server)).with_faults(Arc::clone(&faults)));
        let manager = SyncManager::new(config, tokens.clone(), connector.clone())
            .expect("Failed to start sync manager");

        Self {
            server,
            tokens,
            faults,
            connector,
            manager,
        }
    }

    /// Returns the identity of `user` on the store at `path`.
    pub fn identity(&self, path: impl Into<PathBuf>, user: &str) -> SessionIdentity {
        SessionIdentity::new(path, SERVER_URL, user)
    }

    /// Creates a store at `path` and opens it for `user`.
    pub fn open(&self, path: &str, user: &str) -> (Arc<MemoryStore>, SyncedStore) {
        let store = Arc::new(MemoryStore::new(path));
        let synced = self.open_store(&store, user);
        (store, synced)
    }

    /// Opens an existing store for `user`.
    pub fn open_store(&self, store: &Arc<MemoryStore>, user: &str) -> SyncedStore {
        self.manager
            .open(self.identity(store.path(), user), store.clone())
            .expect("Failed to open synced store")
    }
}

impl Default for SyncFixture {
    fn default() -> Self {
        Self::new()
    }
}
