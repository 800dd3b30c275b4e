//! Conflict detection and classification.
//!
//! The detector summarises what the merged side did since the divergence
//! point and classifies individual unmerged operations against it. It holds
//! no state; the resolver drives it while replaying the unmerged branch.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ClientId, NodeId, Revision};
use crate::ops::{Attr, OpKind, Operation};
use crate::tree::Tree;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Categorisation of a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides removed the same node.
    BothRemoved,
    /// The merged side removed an ancestor of the node.
    CascadingRemoval,
    /// A rename landed on a name the merged side occupied with a file.
    RenameOverwrite,
    /// Two directories met at the same name and were unioned.
    DirectoryUnion,
    /// Both sides created a non-directory at the same name.
    CreateCollision,
    /// An exclusive create found its name taken.
    ExclusiveCreateCollision,
    /// Both sides set the same node's mtime.
    AttributeOverride,
    /// A file and a directory met at the same name.
    TypeMismatch,
    /// The unmerged side removed a directory the merged side populated.
    RemoveNonEmptyDirectory,
    /// A rename targeted a directory that no longer exists.
    RenameIntoRemoved,
    /// A rename would move a directory below itself.
    RenameCycle,
    /// The operation could not be applied to the merged state.
    Inapplicable,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BothRemoved => write!(f, "both_removed"),
            Self::CascadingRemoval => write!(f, "cascading_removal"),
            Self::RenameOverwrite => write!(f, "rename_overwrite"),
            Self::DirectoryUnion => write!(f, "directory_union"),
            Self::CreateCollision => write!(f, "create_collision"),
            Self::ExclusiveCreateCollision => write!(f, "exclusive_create_collision"),
            Self::AttributeOverride => write!(f, "attribute_override"),
            Self::TypeMismatch => write!(f, "type_mismatch"),
            Self::RemoveNonEmptyDirectory => write!(f, "remove_non_empty_directory"),
            Self::RenameIntoRemoved => write!(f, "rename_into_removed"),
            Self::RenameCycle => write!(f, "rename_cycle"),
            Self::Inapplicable => write!(f, "inapplicable"),
        }
    }
}

/// What the resolver did about a conflict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The unmerged operation was applied as-is.
    KeptUnmerged,
    /// The merged state was kept; the unmerged operation was dropped.
    KeptMerged,
    /// Collapsed into an effect the merged side already produced.
    Collapsed,
    /// The unmerged operation was dropped.
    Dropped,
    /// Both sides' entries were unioned.
    Merged,
    /// The merged occupant was replaced by the unmerged node.
    Replaced,
    /// The unmerged node was kept under another name.
    RenamedTo(String),
    /// Reported to the caller instead of applied.
    Rejected,
    /// A merged-side value was restored after replay.
    Reasserted,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeptUnmerged => write!(f, "kept_unmerged"),
            Self::KeptMerged => write!(f, "kept_merged"),
            Self::Collapsed => write!(f, "collapsed"),
            Self::Dropped => write!(f, "dropped"),
            Self::Merged => write!(f, "merged"),
            Self::Replaced => write!(f, "replaced"),
            Self::RenamedTo(name) => write!(f, "renamed_to:{}", name),
            Self::Rejected => write!(f, "rejected"),
            Self::Reasserted => write!(f, "reasserted"),
        }
    }
}

/// A conflict record: the unmerged operation, the merged-side node it
/// collided with (if any), and the resolution taken. Transient; used for
/// diagnostics and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_type: ConflictType,
    pub operation: Operation,
    pub counterpart: Option<NodeId>,
    pub resolution: Resolution,
}

impl Conflict {
    pub fn new(
        conflict_type: ConflictType,
        operation: Operation,
        counterpart: Option<NodeId>,
        resolution: Resolution,
    ) -> Self {
        Self {
            conflict_type,
            operation,
            counterpart,
            resolution,
        }
    }
}

// ---------------------------------------------------------------------------
// Branch summaries
// ---------------------------------------------------------------------------

/// What the merged side did between the divergence point and its head.
#[derive(Debug, Clone, Default)]
pub struct MergedSummary {
    /// Base nodes no longer present in the head.
    pub removed: HashSet<NodeId>,
    /// Targets of explicit merged `Remove` operations.
    pub directly_removed: HashSet<NodeId>,
    /// Head mtime of every node the merged side explicitly set an mtime on.
    pub explicit_mtime: BTreeMap<NodeId, DateTime<Utc>>,
    /// Nodes the merged side gave content to.
    pub content_touched: HashSet<NodeId>,
    /// Nodes the merged side created.
    pub created: HashSet<NodeId>,
}

impl MergedSummary {
    pub fn from_revisions(base: &Tree, head: &Tree, revisions: &[Arc<Revision>]) -> Self {
        let mut summary = Self {
            removed: base.node_ids().filter(|id| !head.contains(*id)).collect(),
            ..Self::default()
        };

        for op in revisions.iter().flat_map(|r| r.ops.iter()) {
            match &op.kind {
                OpKind::Create { node, .. } | OpKind::ExclusiveCreate { node, .. } => {
                    summary.created.insert(*node);
                }
                OpKind::Remove { node, .. } => {
                    summary.directly_removed.insert(*node);
                }
                OpKind::SetAttr {
                    node,
                    attr: Attr::Mtime(_),
                } => {
                    if let Some(n) = head.get(*node) {
                        summary.explicit_mtime.insert(*node, n.mtime);
                    }
                }
                _ if op.adds_content() => {
                    summary.content_touched.insert(op.target());
                }
                _ => {}
            }
        }

        debug!(
            removed = summary.removed.len(),
            created = summary.created.len(),
            explicit_mtimes = summary.explicit_mtime.len(),
            "summarised merged branch"
        );
        summary
    }

    /// Whether the merged side's version of `node` carries content.
    pub fn has_content(&self, head: &Tree, node: NodeId) -> bool {
        self.content_touched.contains(&node) || head.get(node).is_some_and(|n| n.has_content())
    }
}

/// What the unmerged side did, computed once before replay.
#[derive(Debug, Clone, Default)]
pub struct UnmergedSummary {
    pub content_touched: HashSet<NodeId>,
    pub explicit_mtime: HashSet<NodeId>,
}

impl UnmergedSummary {
    pub fn from_ops(ops: &[Operation]) -> Self {
        let mut summary = Self::default();
        for op in ops {
            if op.adds_content() {
                summary.content_touched.insert(op.target());
            }
            if let OpKind::SetAttr {
                node,
                attr: Attr::Mtime(_),
            } = &op.kind
            {
                summary.explicit_mtime.insert(*node);
            }
        }
        summary
    }
}

/// The closure of the merged side's removals as seen from the unmerged
/// side: every removed node plus everything the unmerged side has below a
/// removed node, at any depth.
pub fn removed_closure(local: &Tree, head: &Tree, removed: &HashSet<NodeId>) -> HashSet<NodeId> {
    let mut closure = removed.clone();
    for id in removed {
        closure.extend(
            local
                .descendants(*id)
                .into_iter()
                .filter(|d| !head.contains(*d)),
        );
    }
    closure
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// How a create that found its name occupied gets resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateCollision {
    /// Exclusive create: reported, never resolved locally.
    LostExclusive,
    /// Directory on both sides: union the entries.
    MergeDirectories,
    /// The merged entry wins; the unmerged node is dropped.
    KeepMerged,
    /// The unmerged entry wins; the merged occupant is removed.
    ReplaceWithUnmerged,
    /// File vs directory: the unmerged entry moves aside.
    RenameUnmerged,
}

/// Stateless conflict classifier.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Classify a same-name creation collision.
    ///
    /// Content presence beats arrival order: an empty creation loses to one
    /// that was written or truncated to non-zero length on either branch.
    /// When both carry content the unmerged side, being later in merge
    /// order, wins. When neither does the merged entry is kept.
    pub fn classify_create(
        exclusive: bool,
        creating_dir: bool,
        occupant_is_dir: bool,
        merged_has_content: bool,
        unmerged_has_content: bool,
    ) -> CreateCollision {
        if exclusive {
            return CreateCollision::LostExclusive;
        }
        match (creating_dir, occupant_is_dir) {
            (true, true) => CreateCollision::MergeDirectories,
            (false, false) => match (merged_has_content, unmerged_has_content) {
                (_, true) => CreateCollision::ReplaceWithUnmerged,
                (true, false) | (false, false) => CreateCollision::KeepMerged,
            },
            _ => CreateCollision::RenameUnmerged,
        }
    }

    /// First free name of the form `<name>.conflict.<client>[.<n>]` in `dir`.
    pub fn conflict_name(tree: &Tree, dir: NodeId, name: &str, client: &ClientId) -> String {
        let base = format!("{}.conflict.{}", name, client);
        if tree.child(dir, &base).is_none() {
            return base;
        }
        (1u32..)
            .map(|n| format!("{}.{}", base, n))
            .find(|candidate| tree.child(dir, candidate).is_none())
            .unwrap_or(base)
    }
}
