//! # Strand Session
//!
//! Keeps local object stores in sync with a remote server.
//!
//! Each opened store gets exactly one [`SyncSessionRef`] per
//! [`SessionIdentity`] (store path, server URL and user). A session logs in
//! through a [`TokenProvider`], connects through a [`ChangesetTransport`],
//! uploads every local commit and integrates every server changeset, all on
//! a single background worker thread.
//!
//! ## Session lifecycle
//!
//! ```text
//! WAITING_FOR_ACCESS_TOKEN <-> ACTIVE -> DYING -> INACTIVE
//!                  \             |
//!                   +-----> FATAL_ERROR
//! ```
//!
//! ## Checkpoints
//!
//! [`SyncSessionRef::upload_all_local_changes`] and
//! [`SyncSessionRef::download_all_server_changes`] block the calling thread
//! until the transfer they observe at call time is complete. Both can be
//! cut short with a [`CancelSignal`] or a timeout via [`WaitOptions`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand_session::{SessionIdentity, SyncConfig, SyncManager, WaitOptions};
//!
//! let manager = SyncManager::new(SyncConfig::default(), tokens, connector)?;
//! let identity = SessionIdentity::new("/data/notes.db", "wss://sync.example.com", "alice");
//! let synced = manager.open(identity, store)?;
//!
//! synced.session().upload_all_local_changes(&WaitOptions::new())?;
//! synced.close();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod driver;
mod error;
mod identity;
mod manager;
mod registry;
mod session;
mod state;
mod store;
#[cfg(test)]
mod testing;
mod token;
mod transport;
mod wait;
mod worker;

pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use identity::SessionIdentity;
pub use manager::{SyncManager, SyncedStore};
pub use registry::{SessionEnvironment, SessionRegistry};
pub use session::SyncSessionRef;
pub use state::SessionState;
pub use store::{CommitListener, LocalStore, StoreError, StoreResult, SyncProgress};
pub use token::{TokenError, TokenProvider};
pub use transport::{
    ChangesetStream, ChangesetTransport, TransportConnector, TransportError, TransportResult,
};
pub use wait::{
    CancelSignal, Direction, Termination, WaitHandle, WaitHandleManager, WaitId, WaitOptions,
    WaitOutcome,
};
pub use worker::SyncWorker;

// Re-export the protocol types that appear in this crate's API
pub use strand_protocol::{AccessToken, Changeset, ClientId, ObjectChange, Version};
