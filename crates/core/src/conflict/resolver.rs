//! Conflict resolution: replay the unmerged branch on top of the merged head.
//!
//! [`ConflictResolver::resolve`] is a pure function of its [`ResolveInput`].
//! It walks the unmerged operations in order, classifies each against the
//! merged side, and emits a rewritten sequence that applies cleanly to the
//! merged head. Merged-side effects are already in the head, so they always
//! come first; the unmerged operations follow in their original relative
//! order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use super::detector::{
    removed_closure, Conflict, ConflictDetector, ConflictType, CreateCollision, MergedSummary,
    Resolution, UnmergedSummary,
};
use crate::errors::{ConflictError, TreeError};
use crate::identity::{canonical_path, join};
use crate::models::{ClientId, NodeId, Revision};
use crate::ops::{Attr, CreateKind, OpKind, Operation};
use crate::tree::Tree;

// ---------------------------------------------------------------------------
// Inputs & outputs
// ---------------------------------------------------------------------------

/// Everything a resolution pass reads.
pub struct ResolveInput<'a> {
    /// Client whose unmerged branch is being resolved.
    pub client: &'a ClientId,
    /// Snapshot at the divergence point.
    pub base: &'a Tree,
    /// Latest merged revision.
    pub merged_head: &'a Revision,
    /// Merged revisions after the divergence point, in sequence order.
    pub merged_revisions: &'a [Arc<Revision>],
    /// The client's local tree (base plus its unmerged operations).
    pub local: &'a Tree,
    /// The unmerged operations, oldest first.
    pub unmerged: &'a [Operation],
}

/// An exclusive create that lost its name to the merged side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostExclusive {
    pub node: NodeId,
    pub path: String,
    pub name: String,
}

impl LostExclusive {
    pub fn to_error(&self) -> ConflictError {
        ConflictError::AlreadyExists {
            path: self.path.clone(),
            name: self.name.clone(),
        }
    }
}

/// Output of a resolution pass.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    /// Operations to apply on top of the merged head.
    pub ops: Vec<Operation>,
    pub conflicts: Vec<Conflict>,
    pub lost_exclusive: Vec<LostExclusive>,
}

impl Resolved {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Stateless resolver entry point.
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn resolve(input: &ResolveInput<'_>) -> Resolved {
        let mut replay = Replay::new(input);
        for op in input.unmerged {
            replay.step(op);
        }
        replay.reassert_mtimes();

        debug!(
            client = %input.client,
            unmerged = input.unmerged.len(),
            resolved = replay.out.len(),
            conflicts = replay.conflicts.len(),
            "resolution pass finished"
        );
        Resolved {
            ops: replay.out,
            conflicts: replay.conflicts,
            lost_exclusive: replay.lost,
        }
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

struct Replay<'a> {
    input: &'a ResolveInput<'a>,
    merged: MergedSummary,
    unmerged: UnmergedSummary,
    /// Nodes removed by the merged side, with everything below them.
    removed: HashSet<NodeId>,
    /// Working copy: merged head plus everything emitted so far.
    work: Tree,
    /// Unmerged nodes folded into a merged node.
    alias: HashMap<NodeId, NodeId>,
    /// Unmerged nodes whose operations are discarded from here on.
    dropped: HashSet<NodeId>,
    /// Nodes whose mtime the unmerged side set explicitly.
    mtime_overrides: HashSet<NodeId>,
    out: Vec<Operation>,
    conflicts: Vec<Conflict>,
    lost: Vec<LostExclusive>,
}

impl<'a> Replay<'a> {
    fn new(input: &'a ResolveInput<'a>) -> Self {
        let head = &input.merged_head.tree;
        let merged = MergedSummary::from_revisions(input.base, head, input.merged_revisions);
        let removed = removed_closure(input.local, head, &merged.removed);
        Self {
            input,
            unmerged: UnmergedSummary::from_ops(input.unmerged),
            merged,
            removed,
            work: (**head).clone(),
            alias: HashMap::new(),
            dropped: HashSet::new(),
            mtime_overrides: HashSet::new(),
            out: Vec::new(),
            conflicts: Vec::new(),
            lost: Vec::new(),
        }
    }

    fn canon(&self, mut id: NodeId) -> NodeId {
        let mut hops = 0;
        while let Some(next) = self.alias.get(&id) {
            id = *next;
            hops += 1;
            if hops > self.alias.len() {
                break;
            }
        }
        id
    }

    fn is_dead(&self, id: NodeId) -> bool {
        self.dropped.contains(&id) || self.removed.contains(&id) || !self.work.contains(id)
    }

    fn emit(&mut self, op: Operation) -> Result<(), TreeError> {
        self.work.apply(&op)?;
        self.out.push(op);
        Ok(())
    }

    fn record(
        &mut self,
        conflict_type: ConflictType,
        op: &Operation,
        counterpart: Option<NodeId>,
        resolution: Resolution,
    ) {
        debug!(
            client = %self.input.client,
            op = %op,
            conflict = %conflict_type,
            resolution = %resolution,
            "classified unmerged operation"
        );
        self.conflicts.push(Conflict::new(
            conflict_type,
            op.clone(),
            counterpart,
            resolution,
        ));
    }

    fn location(&self, id: NodeId) -> Result<(NodeId, String), TreeError> {
        let node = self
            .work
            .get(id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))?;
        let parent = node
            .parent
            .ok_or_else(|| TreeError::InvalidPath("the root has no location".into()))?;
        Ok((parent, node.name.clone()))
    }

    fn is_populated_dir(&self, id: NodeId) -> bool {
        self.work
            .children(id)
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    fn is_dir(&self, id: NodeId) -> bool {
        self.work.get(id).is_some_and(|n| n.is_dir())
    }

    fn step(&mut self, raw: &Operation) {
        let op = raw.map_ids(|id| self.canon(id));
        let result = match &op.kind {
            OpKind::Create {
                parent,
                name,
                node,
                kind,
            } => self.create(&op, *parent, name, *node, kind, false),
            OpKind::ExclusiveCreate { parent, name, node } => {
                self.create(&op, *parent, name, *node, &CreateKind::File, true)
            }
            OpKind::Remove { node, .. } => self.remove(&op, *node),
            OpKind::Rename {
                node,
                dst_parent,
                dst_name,
                ..
            } => self.rename(&op, *node, *dst_parent, dst_name),
            OpKind::Write { node, .. } | OpKind::Truncate { node, .. } => {
                self.modify(&op, *node)
            }
            OpKind::SetAttr { node, attr } => {
                if matches!(attr, Attr::Mtime(_)) {
                    self.mtime_overrides.insert(*node);
                    if self.merged.explicit_mtime.contains_key(node) && !self.is_dead(*node) {
                        self.record(
                            ConflictType::AttributeOverride,
                            &op,
                            Some(*node),
                            Resolution::KeptUnmerged,
                        );
                    }
                }
                self.modify(&op, *node)
            }
        };

        if let Err(err) = result {
            warn!(
                client = %self.input.client,
                op = %op,
                error = %err,
                "unmerged operation does not apply to merged state, dropping"
            );
            if matches!(
                op.kind,
                OpKind::Create { .. } | OpKind::ExclusiveCreate { .. }
            ) {
                self.dropped.insert(op.target());
            }
            self.record(
                ConflictType::Inapplicable,
                &op,
                None,
                Resolution::Dropped,
            );
        }
    }

    // -----------------------------------------------------------------------
    // Per-kind handlers
    // -----------------------------------------------------------------------

    fn create(
        &mut self,
        op: &Operation,
        parent: NodeId,
        name: &str,
        node: NodeId,
        kind: &CreateKind,
        exclusive: bool,
    ) -> Result<(), TreeError> {
        if self.is_dead(parent) {
            self.dropped.insert(node);
            warn!(
                client = %self.input.client,
                op = %op,
                "parent was removed on the merged branch, dropping create"
            );
            self.record(
                ConflictType::CascadingRemoval,
                op,
                Some(parent),
                Resolution::Dropped,
            );
            return Ok(());
        }

        let Some(occupant) = self.work.child(parent, name) else {
            return self.emit(op.clone());
        };

        let collision = ConflictDetector::classify_create(
            exclusive,
            kind.is_directory(),
            self.is_dir(occupant),
            self.merged.has_content(&self.work, occupant),
            self.unmerged.content_touched.contains(&node),
        );

        match collision {
            CreateCollision::LostExclusive => {
                self.dropped.insert(node);
                let dir = canonical_path(&self.work, parent).unwrap_or_default();
                let lost = LostExclusive {
                    node,
                    path: join(&dir, name),
                    name: name.to_string(),
                };
                warn!(
                    client = %self.input.client,
                    path = %lost.path,
                    "exclusive create lost its name to the merged branch"
                );
                self.lost.push(lost);
                self.record(
                    ConflictType::ExclusiveCreateCollision,
                    op,
                    Some(occupant),
                    Resolution::Rejected,
                );
            }
            CreateCollision::MergeDirectories => {
                self.alias.insert(node, occupant);
                self.record(
                    ConflictType::DirectoryUnion,
                    op,
                    Some(occupant),
                    Resolution::Merged,
                );
            }
            CreateCollision::KeepMerged => {
                self.dropped.insert(node);
                self.record(
                    ConflictType::CreateCollision,
                    op,
                    Some(occupant),
                    Resolution::KeptMerged,
                );
            }
            CreateCollision::ReplaceWithUnmerged => {
                self.emit(op.derive(OpKind::Remove {
                    parent,
                    name: name.to_string(),
                    node: occupant,
                }))?;
                self.emit(op.clone())?;
                self.record(
                    ConflictType::CreateCollision,
                    op,
                    Some(occupant),
                    Resolution::Replaced,
                );
            }
            CreateCollision::RenameUnmerged => {
                let renamed =
                    ConflictDetector::conflict_name(&self.work, parent, name, self.input.client);
                self.emit(op.derive(OpKind::Create {
                    parent,
                    name: renamed.clone(),
                    node,
                    kind: kind.clone(),
                }))?;
                self.record(
                    ConflictType::TypeMismatch,
                    op,
                    Some(occupant),
                    Resolution::RenamedTo(renamed),
                );
            }
        }
        Ok(())
    }

    fn remove(&mut self, op: &Operation, node: NodeId) -> Result<(), TreeError> {
        if self.dropped.contains(&node) {
            return Ok(());
        }
        if self.is_dead(node) {
            let conflict_type = if self.merged.directly_removed.contains(&node) {
                ConflictType::BothRemoved
            } else {
                ConflictType::CascadingRemoval
            };
            self.record(conflict_type, op, Some(node), Resolution::Collapsed);
            return Ok(());
        }
        if self.is_populated_dir(node) {
            self.record(
                ConflictType::RemoveNonEmptyDirectory,
                op,
                Some(node),
                Resolution::KeptMerged,
            );
            return Ok(());
        }
        let (parent, name) = self.location(node)?;
        self.emit(op.derive(OpKind::Remove { parent, name, node }))
    }

    fn rename(
        &mut self,
        op: &Operation,
        node: NodeId,
        dst_parent: NodeId,
        dst_name: &str,
    ) -> Result<(), TreeError> {
        if self.dropped.contains(&node) {
            return Ok(());
        }
        if self.is_dead(node) {
            warn!(
                client = %self.input.client,
                op = %op,
                "renamed node was removed on the merged branch"
            );
            self.record(
                ConflictType::CascadingRemoval,
                op,
                Some(node),
                Resolution::Dropped,
            );
            return Ok(());
        }
        if self.is_dead(dst_parent) {
            self.record(
                ConflictType::RenameIntoRemoved,
                op,
                Some(dst_parent),
                Resolution::Dropped,
            );
            return Ok(());
        }
        let moving_dir = self.is_dir(node);
        if moving_dir && self.work.is_ancestor(node, dst_parent) {
            self.record(
                ConflictType::RenameCycle,
                op,
                Some(dst_parent),
                Resolution::Dropped,
            );
            return Ok(());
        }

        let (src_parent, src_name) = self.location(node)?;
        let to = |dst_name: String| {
            op.derive(OpKind::Rename {
                node,
                src_parent,
                src_name: src_name.clone(),
                dst_parent,
                dst_name,
            })
        };

        let occupant = match self.work.child(dst_parent, dst_name) {
            Some(occupant) if occupant != node => occupant,
            _ => return self.emit(to(dst_name.to_string())),
        };
        let from_merged = !self.input.local.contains(occupant);

        match (moving_dir, self.is_dir(occupant)) {
            (false, false) => {
                self.emit(to(dst_name.to_string()))?;
                if from_merged {
                    self.record(
                        ConflictType::RenameOverwrite,
                        op,
                        Some(occupant),
                        Resolution::Replaced,
                    );
                }
            }
            (true, true) if !self.is_populated_dir(occupant) => {
                self.emit(to(dst_name.to_string()))?;
            }
            (true, true) => {
                self.union_into(op, node, occupant)?;
                self.record(
                    ConflictType::DirectoryUnion,
                    op,
                    Some(occupant),
                    Resolution::Merged,
                );
            }
            _ => {
                let renamed = ConflictDetector::conflict_name(
                    &self.work,
                    dst_parent,
                    dst_name,
                    self.input.client,
                );
                self.emit(to(renamed.clone()))?;
                self.record(
                    ConflictType::TypeMismatch,
                    op,
                    Some(occupant),
                    Resolution::RenamedTo(renamed),
                );
            }
        }
        Ok(())
    }

    /// Fold directory `src` into directory `dst`: move every child across
    /// (recursively for directories on both sides), then remove `src` and
    /// alias it onto `dst`.
    fn union_into(&mut self, op: &Operation, src: NodeId, dst: NodeId) -> Result<(), TreeError> {
        for (name, child) in self.work.children(src)? {
            let target_name = match self.work.child(dst, &name) {
                None => name.clone(),
                Some(existing) => match (self.is_dir(child), self.is_dir(existing)) {
                    (true, true) => {
                        self.union_into(op, child, existing)?;
                        continue;
                    }
                    (false, false) => name.clone(),
                    _ => ConflictDetector::conflict_name(&self.work, dst, &name, self.input.client),
                },
            };
            self.emit(op.derive(OpKind::Rename {
                node: child,
                src_parent: src,
                src_name: name,
                dst_parent: dst,
                dst_name: target_name,
            }))?;
        }

        let (parent, name) = self.location(src)?;
        self.emit(op.derive(OpKind::Remove {
            parent,
            name,
            node: src,
        }))?;
        self.alias.insert(src, dst);
        Ok(())
    }

    fn modify(&mut self, op: &Operation, node: NodeId) -> Result<(), TreeError> {
        if self.dropped.contains(&node) {
            return Ok(());
        }
        if self.is_dead(node) {
            self.record(
                ConflictType::CascadingRemoval,
                op,
                Some(node),
                Resolution::Dropped,
            );
            return Ok(());
        }
        self.emit(op.clone())
    }

    /// Restore merged-side explicit mtimes that replayed operations bumped
    /// implicitly. Skipped when nothing was emitted, so an empty unmerged
    /// branch leaves the head untouched.
    fn reassert_mtimes(&mut self) {
        if self.out.is_empty() {
            return;
        }
        let seq = self.input.merged_head.seq;
        let explicit: Vec<_> = self
            .merged
            .explicit_mtime
            .iter()
            .map(|(id, t)| (*id, *t))
            .collect();
        for (node, mtime) in explicit {
            if self.mtime_overrides.contains(&node) {
                continue;
            }
            if !self.work.get(node).is_some_and(|n| n.mtime != mtime) {
                continue;
            }
            let op = Operation::new(
                OpKind::SetAttr {
                    node,
                    attr: Attr::Mtime(mtime),
                },
                seq,
            );
            if self.emit(op.clone()).is_ok() {
                self.record(
                    ConflictType::AttributeOverride,
                    &op,
                    Some(node),
                    Resolution::Reasserted,
                );
            }
        }
    }
}
