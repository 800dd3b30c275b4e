//! Domain model types used throughout treesync.
//!
//! These types bridge the tree arena, the conflict resolver, the sequencer
//! and the per-client sync engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ops::Operation;
use crate::tree::Tree;

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Globally unique, immutable identity of a tree node.
///
/// Assigned at creation and independent of the node's path, so it survives
/// renames and moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Allocate a fresh identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Name of a client (device) taking part in synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Directory entries
// ---------------------------------------------------------------------------

/// Type of a directory entry as presented to adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Directory,
    Symlink,
    Executable,
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "FILE"),
            Self::Directory => write!(f, "DIR"),
            Self::Symlink => write!(f, "SYM"),
            Self::Executable => write!(f, "EXEC"),
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub node: NodeId,
    pub entry_type: EntryType,
    pub mtime: DateTime<Utc>,
}

/// Stat result for a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub node: NodeId,
    pub entry_type: EntryType,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

/// An immutable, sequence-numbered snapshot of the whole tree.
///
/// Only the sequencer mints revisions; once committed they are shared behind
/// an `Arc` and never mutated.
#[derive(Debug, Clone)]
pub struct Revision {
    /// Monotonically increasing sequence number.
    pub seq: u64,
    /// Parent sequence number; `None` only for the initial revision.
    pub parent: Option<u64>,
    /// Client whose commit produced this revision.
    pub writer: ClientId,
    /// The snapshot itself.
    pub tree: Arc<Tree>,
    /// Operations that turn the parent snapshot into this one.
    pub ops: Vec<Operation>,
    /// Structure digest of `tree`.
    pub digest: String,
    pub committed_at: DateTime<Utc>,
}

impl Revision {
    /// Build the initial revision (no parent) around `tree`.
    pub fn initial(writer: ClientId, tree: Tree) -> Self {
        let digest = tree.structure_digest();
        Self {
            seq: 0,
            parent: None,
            writer,
            tree: Arc::new(tree),
            ops: Vec::new(),
            digest,
            committed_at: Utc::now(),
        }
    }

    /// Root identity of the snapshot.
    pub fn root(&self) -> NodeId {
        self.tree.root()
    }
}

/// A candidate revision submitted to the sequencer.
#[derive(Debug, Clone)]
pub struct RevisionDraft {
    pub writer: ClientId,
    pub tree: Arc<Tree>,
    pub ops: Vec<Operation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ids_are_unique() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 8);
    }

    #[test]
    fn test_entry_type_display() {
        assert_eq!(EntryType::File.to_string(), "FILE");
        assert_eq!(EntryType::Directory.to_string(), "DIR");
        assert_eq!(EntryType::Symlink.to_string(), "SYM");
        assert_eq!(EntryType::Executable.to_string(), "EXEC");
    }

    #[test]
    fn test_initial_revision() {
        let rev = Revision::initial(ClientId::new("sequencer"), Tree::empty());
        assert_eq!(rev.seq, 0);
        assert!(rev.parent.is_none());
        assert_eq!(rev.digest, rev.tree.structure_digest());
    }
}
