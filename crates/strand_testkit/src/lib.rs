//! # Strand Testkit
//!
//! Test utilities for Strand.
//!
//! This crate provides:
//! - [`MemoryStore`], an in-memory local store
//! - [`ServerTransport`] and [`AuthorityTokenProvider`], collaborators
//!   backed by an in-process `strand_server`
//! - [`FaultPlan`] and [`FlakyTransport`] for injecting transient and
//!   authentication failures
//! - [`SyncFixture`] and tracing setup for scenario tests
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strand_testkit::prelude::*;
//!
//! #[test]
//! fn upload_reaches_server() {
//!     let fixture = SyncFixture::new();
//!     let (store, synced) = fixture.open("/tmp/dogs.db", "alice");
//!     store.put("Dog", "fido", vec![1]).unwrap();
//!     synced.session().upload_all_local_changes(&wait_options()).unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod store;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::store::*;
    pub use crate::transport::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use store::*;
pub use transport::*;
