//! Versions and client identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A position in a totally ordered history.
///
/// Local stores number their commits with versions, and the server numbers
/// integrated changesets with its own versions. The two sequences are
/// independent; `Version::ZERO` means "nothing yet" in both.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The version preceding every commit.
    pub const ZERO: Version = Version(0);

    /// Creates a version from its raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the version that follows this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifies the session that produced a changeset.
///
/// Every session gets a fresh id, so the server can echo a changeset back to
/// its author and the author can recognise it without re-applying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generates a new random client id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        assert!(Version::ZERO < Version::new(1));
        assert_eq!(Version::new(4).next(), Version::new(5));
        assert_eq!(Version::new(u64::MAX).next(), Version::new(u64::MAX));
        assert_eq!(Version::from(7).get(), 7);
    }

    #[test]
    fn version_display() {
        assert_eq!(Version::new(12).to_string(), "v12");
    }

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(ClientId::generate(), ClientId::generate());
    }
}
