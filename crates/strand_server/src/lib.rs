//! # Strand Sync Server
//!
//! In-process reference sync server for Strand.
//!
//! This crate provides:
//! - A shared changeset log with a high-water mark and live subscriptions
//! - Duplicate-upload detection per client
//! - An HMAC-SHA256 token authority with expiry, refresh and revocation
//!
//! It speaks the same CBOR changeset frames a network server would, but
//! has no listener of its own: tests and demos call it directly through a
//! transport adapter.
//!
//! # Authentication
//!
//! ```rust,ignore
//! use strand_server::{AuthConfig, ServerConfig, SyncServer};
//!
//! let config = ServerConfig::new()
//!     .with_auth(AuthConfig::new(b"my-secure-secret".to_vec()));
//! let server = SyncServer::new(config);
//! let token = server.authority().issue("alice")?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod auth;
mod config;
mod error;
mod log;
mod server;

pub use auth::TokenAuthority;
pub use config::{AuthConfig, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use log::{ChangesetLog, Subscription};
pub use server::{FrameFeed, SyncServer};
