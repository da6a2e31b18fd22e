//! # Strand Protocol
//!
//! Data types exchanged between a Strand client session and its server.
//!
//! This crate provides:
//! - `Version` and `ClientId` for ordering and attribution
//! - `ObjectChange` and `Changeset` as the unit of replication
//! - `AccessToken` issued by the token authority
//! - CBOR encoding/decoding of changesets
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod codec;
mod token;
mod version;

pub use changeset::{Changeset, ObjectChange};
pub use codec::{decode_changeset, encode_changeset, CodecError, CodecResult};
pub use token::AccessToken;
pub use version::{ClientId, Version};
