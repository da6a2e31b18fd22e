//! Changesets: the atomic unit of replication.

use crate::version::{ClientId, Version};
use serde::{Deserialize, Serialize};

/// A single object mutation inside a changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectChange {
    /// Object was created or replaced.
    Put {
        /// Object type name (e.g. `"AllTypes"`).
        class: String,
        /// Object identifier, unique within its class.
        object_id: String,
        /// Encoded object body.
        payload: Vec<u8>,
    },
    /// Object was removed.
    Delete {
        /// Object type name.
        class: String,
        /// Object identifier.
        object_id: String,
    },
}

impl ObjectChange {
    /// Creates a put change.
    pub fn put(class: impl Into<String>, object_id: impl Into<String>, payload: Vec<u8>) -> Self {
        ObjectChange::Put {
            class: class.into(),
            object_id: object_id.into(),
            payload,
        }
    }

    /// Creates a delete change.
    pub fn delete(class: impl Into<String>, object_id: impl Into<String>) -> Self {
        ObjectChange::Delete {
            class: class.into(),
            object_id: object_id.into(),
        }
    }

    /// Returns the object type this change touches.
    pub fn class(&self) -> &str {
        match self {
            ObjectChange::Put { class, .. } | ObjectChange::Delete { class, .. } => class,
        }
    }

    /// Returns the object id this change touches.
    pub fn object_id(&self) -> &str {
        match self {
            ObjectChange::Put { object_id, .. } | ObjectChange::Delete { object_id, .. } => {
                object_id
            }
        }
    }
}

/// An ordered group of changes committed in one local transaction.
///
/// A changeset starts life in a local store with only `local_version` set.
/// The uploading session stamps it with its `origin`, and the server assigns
/// `server_version` when it integrates it into the shared history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    /// Session that produced the changeset, once uploaded.
    pub origin: Option<ClientId>,
    /// Version of the originating local commit.
    pub local_version: Version,
    /// Position in the server history, once integrated.
    pub server_version: Option<Version>,
    /// The mutations, in commit order.
    pub changes: Vec<ObjectChange>,
}

impl Changeset {
    /// Creates a local changeset for the given commit version.
    pub fn local(local_version: Version, changes: Vec<ObjectChange>) -> Self {
        Self {
            origin: None,
            local_version,
            server_version: None,
            changes,
        }
    }

    /// Returns a copy attributed to the given session.
    pub fn stamped_by(mut self, origin: ClientId) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Returns a copy positioned in the server history.
    pub fn integrated_at(mut self, server_version: Version) -> Self {
        self.server_version = Some(server_version);
        self
    }

    /// Returns true if this changeset was produced by `client`.
    pub fn is_from(&self, client: ClientId) -> bool {
        self.origin == Some(client)
    }

    /// Returns the number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if the changeset carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
