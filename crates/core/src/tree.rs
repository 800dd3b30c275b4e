//! Arena-backed directory tree.
//!
//! Nodes live in a map keyed by [`NodeId`] and carry an explicit parent
//! back-reference, so there is no object graph to keep alive and a snapshot
//! is just a clone of the map. Directory entries reference identities; an
//! identity is reachable from at most one entry at a time.
//!
//! Every structural change (create, remove, rename) stamps the tree with a
//! fresh, process-wide generation number. Clones share the generation of the
//! state they were copied from, which is what the path cache keys on.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::errors::TreeError;
use crate::models::{DirEntry, EntryType, NodeId, Stat};
use crate::ops::{Attr, CreateKind, OpKind, Operation};

/// Largest file a write or truncate may produce, in bytes.
pub const MAX_FILE_SIZE: u64 = 1 << 32;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Payload of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Directory { entries: BTreeMap<String, NodeId> },
    File { data: Vec<u8>, executable: bool },
    Symlink { target: String },
}

/// One record of the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    /// `None` only for the root.
    pub parent: Option<NodeId>,
    /// Name under `parent`; empty for the root.
    pub name: String,
    pub mtime: DateTime<Utc>,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn entry_type(&self) -> EntryType {
        match &self.kind {
            NodeKind::Directory { .. } => EntryType::Directory,
            NodeKind::File {
                executable: true, ..
            } => EntryType::Executable,
            NodeKind::File { .. } => EntryType::File,
            NodeKind::Symlink { .. } => EntryType::Symlink,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::Directory { entries } => entries.len() as u64,
            NodeKind::File { data, .. } => data.len() as u64,
            NodeKind::Symlink { target } => target.len() as u64,
        }
    }

    /// Files and symlinks with at least one byte of payload.
    pub fn has_content(&self) -> bool {
        !self.is_dir() && self.size() > 0
    }

    fn entries(&self) -> Option<&BTreeMap<String, NodeId>> {
        match &self.kind {
            NodeKind::Directory { entries } => Some(entries),
            _ => None,
        }
    }

    fn entries_mut(&mut self) -> Option<&mut BTreeMap<String, NodeId>> {
        match &mut self.kind {
            NodeKind::Directory { entries } => Some(entries),
            _ => None,
        }
    }
}

/// Reject names that cannot appear as a single path component.
pub fn validate_name(name: &str) -> Result<(), TreeError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(TreeError::InvalidPath(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// A whole directory tree.
#[derive(Debug, Clone)]
pub struct Tree {
    root: NodeId,
    nodes: HashMap<NodeId, Node>,
    generation: u64,
}

impl Tree {
    /// A tree holding only an empty root directory.
    pub fn new(root: NodeId, mtime: DateTime<Utc>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                id: root,
                parent: None,
                name: String::new(),
                mtime,
                kind: NodeKind::Directory {
                    entries: BTreeMap::new(),
                },
            },
        );
        Self {
            root,
            nodes,
            generation: next_generation(),
        }
    }

    pub fn empty() -> Self {
        Self::new(NodeId::new(), Utc::now())
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    fn node(&self, id: NodeId) -> Result<&Node, TreeError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, TreeError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))
    }

    /// `(parent, name) -> child` lookup.
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes
            .get(&parent)
            .and_then(Node::entries)
            .and_then(|entries| entries.get(name).copied())
    }

    /// Sorted `(name, child)` pairs of a directory.
    pub fn children(&self, dir: NodeId) -> Result<Vec<(String, NodeId)>, TreeError> {
        let node = self.node(dir)?;
        let entries = node
            .entries()
            .ok_or_else(|| TreeError::NotADirectory(node.name.clone()))?;
        Ok(entries.iter().map(|(n, id)| (n.clone(), *id)).collect())
    }

    /// Directory listing with types and mtimes.
    pub fn entries(&self, dir: NodeId) -> Result<Vec<DirEntry>, TreeError> {
        self.children(dir)?
            .into_iter()
            .map(|(name, id)| {
                let child = self.node(id)?;
                Ok(DirEntry {
                    name,
                    node: id,
                    entry_type: child.entry_type(),
                    mtime: child.mtime,
                })
            })
            .collect()
    }

    pub fn stat(&self, id: NodeId) -> Result<Stat, TreeError> {
        let node = self.node(id)?;
        Ok(Stat {
            node: id,
            entry_type: node.entry_type(),
            size: node.size(),
            mtime: node.mtime,
        })
    }

    /// Whether `ancestor` is `node` or lies on its parent chain.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    /// All nodes strictly below `id`, parents before children.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(entries) = self.nodes.get(&current).and_then(Node::entries) {
                for child in entries.values() {
                    out.push(*child);
                    stack.push(*child);
                }
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Apply one operation in place.
    ///
    /// Operations address nodes by identity, so a node is found wherever it
    /// currently lives; the `src_*` and `parent`/`name` fields of `Remove`
    /// and `Rename` are informational.
    pub fn apply(&mut self, op: &Operation) -> Result<(), TreeError> {
        let ts = op.timestamp;
        match &op.kind {
            OpKind::Create {
                parent,
                name,
                node,
                kind,
            } => self.insert(*parent, name, *node, kind, ts),
            OpKind::ExclusiveCreate { parent, name, node } => {
                self.insert(*parent, name, *node, &CreateKind::File, ts)
            }
            OpKind::Remove { node, .. } => self.remove(*node, ts),
            OpKind::Rename {
                node,
                dst_parent,
                dst_name,
                ..
            } => self.rename(*node, *dst_parent, dst_name, ts),
            OpKind::Write { node, offset, data } => self.write(*node, *offset, data, ts),
            OpKind::Truncate { node, size } => self.truncate(*node, *size, ts),
            OpKind::SetAttr { node, attr } => self.set_attr(*node, attr),
        }
    }

    fn insert(
        &mut self,
        parent: NodeId,
        name: &str,
        id: NodeId,
        kind: &CreateKind,
        ts: DateTime<Utc>,
    ) -> Result<(), TreeError> {
        validate_name(name)?;
        if self.nodes.contains_key(&id) {
            return Err(TreeError::Corrupt(format!("identity {} already in use", id)));
        }
        let dir = self.node_mut(parent)?;
        let dir_name = dir.name.clone();
        let entries = dir
            .entries_mut()
            .ok_or(TreeError::NotADirectory(dir_name))?;
        if entries.contains_key(name) {
            return Err(TreeError::AlreadyExists(name.to_string()));
        }
        entries.insert(name.to_string(), id);
        dir.mtime = ts;

        let kind = match kind {
            CreateKind::File => NodeKind::File {
                data: Vec::new(),
                executable: false,
            },
            CreateKind::Directory => NodeKind::Directory {
                entries: BTreeMap::new(),
            },
            CreateKind::Symlink { target } => NodeKind::Symlink {
                target: target.clone(),
            },
        };
        self.nodes.insert(
            id,
            Node {
                id,
                parent: Some(parent),
                name: name.to_string(),
                mtime: ts,
                kind,
            },
        );
        self.generation = next_generation();
        Ok(())
    }

    fn remove(&mut self, id: NodeId, ts: DateTime<Utc>) -> Result<(), TreeError> {
        let node = self.node(id)?;
        let parent = node
            .parent
            .ok_or_else(|| TreeError::InvalidPath("cannot remove the root".into()))?;
        if node.entries().is_some_and(|e| !e.is_empty()) {
            return Err(TreeError::DirectoryNotEmpty(node.name.clone()));
        }
        let name = node.name.clone();
        self.detach(parent, &name, ts)?;
        self.nodes.remove(&id);
        self.generation = next_generation();
        Ok(())
    }

    fn rename(
        &mut self,
        id: NodeId,
        dst_parent: NodeId,
        dst_name: &str,
        ts: DateTime<Utc>,
    ) -> Result<(), TreeError> {
        validate_name(dst_name)?;
        let node = self.node(id)?;
        let src_parent = node
            .parent
            .ok_or_else(|| TreeError::InvalidPath("cannot move the root".into()))?;
        let src_name = node.name.clone();
        let moving_dir = node.is_dir();

        let dst = self.node(dst_parent)?;
        if !dst.is_dir() {
            return Err(TreeError::NotADirectory(dst.name.clone()));
        }
        if moving_dir && self.is_ancestor(id, dst_parent) {
            return Err(TreeError::WouldCycle(src_name));
        }

        if let Some(occupant) = self.child(dst_parent, dst_name) {
            if occupant == id {
                return Ok(());
            }
            let occ = self.node(occupant)?;
            match (moving_dir, occ.is_dir()) {
                (false, false) => {}
                (true, true) => {
                    if occ.entries().is_some_and(|e| !e.is_empty()) {
                        return Err(TreeError::DirectoryNotEmpty(dst_name.to_string()));
                    }
                }
                (false, true) => return Err(TreeError::IsADirectory(dst_name.to_string())),
                (true, false) => return Err(TreeError::NotADirectory(dst_name.to_string())),
            }
            // POSIX rename semantics: the occupant is replaced.
            self.detach(dst_parent, dst_name, ts)?;
            self.nodes.remove(&occupant);
        }

        self.detach(src_parent, &src_name, ts)?;
        let dst = self.node_mut(dst_parent)?;
        if let Some(entries) = dst.entries_mut() {
            entries.insert(dst_name.to_string(), id);
        }
        dst.mtime = ts;
        let node = self.node_mut(id)?;
        node.parent = Some(dst_parent);
        node.name = dst_name.to_string();
        self.generation = next_generation();
        Ok(())
    }

    fn detach(&mut self, parent: NodeId, name: &str, ts: DateTime<Utc>) -> Result<(), TreeError> {
        let dir = self.node_mut(parent)?;
        let dir_name = dir.name.clone();
        let entries = dir
            .entries_mut()
            .ok_or(TreeError::NotADirectory(dir_name))?;
        entries
            .remove(name)
            .ok_or_else(|| TreeError::NotFound(name.to_string()))?;
        dir.mtime = ts;
        Ok(())
    }

    fn file_data(&mut self, id: NodeId) -> Result<(&mut Vec<u8>, &mut DateTime<Utc>), TreeError> {
        let node = self.node_mut(id)?;
        match &mut node.kind {
            NodeKind::File { data, .. } => Ok((data, &mut node.mtime)),
            NodeKind::Directory { .. } => Err(TreeError::IsADirectory(node.name.clone())),
            NodeKind::Symlink { .. } => Err(TreeError::NotAFile(node.name.clone())),
        }
    }

    fn write(
        &mut self,
        id: NodeId,
        offset: u64,
        bytes: &[u8],
        ts: DateTime<Utc>,
    ) -> Result<(), TreeError> {
        let (data, mtime) = self.file_data(id)?;
        if !bytes.is_empty() {
            let too_large =
                || TreeError::FileTooLarge(format!("write of {} bytes at {}", bytes.len(), offset));
            let end = offset
                .checked_add(bytes.len() as u64)
                .filter(|end| *end <= MAX_FILE_SIZE)
                .ok_or_else(too_large)?;
            let start = usize::try_from(offset).map_err(|_| too_large())?;
            let end = usize::try_from(end).map_err(|_| too_large())?;
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(bytes);
        }
        *mtime = ts;
        Ok(())
    }

    fn truncate(&mut self, id: NodeId, size: u64, ts: DateTime<Utc>) -> Result<(), TreeError> {
        let (data, mtime) = self.file_data(id)?;
        let len = usize::try_from(size)
            .ok()
            .filter(|_| size <= MAX_FILE_SIZE)
            .ok_or_else(|| TreeError::FileTooLarge(format!("truncate to {}", size)))?;
        data.resize(len, 0);
        *mtime = ts;
        Ok(())
    }

    fn set_attr(&mut self, id: NodeId, attr: &Attr) -> Result<(), TreeError> {
        let node = self.node_mut(id)?;
        match attr {
            Attr::Mtime(t) => node.mtime = *t,
            Attr::Executable(flag) => match &mut node.kind {
                NodeKind::File { executable, .. } => *executable = *flag,
                _ => return Err(TreeError::NotAFile(node.name.clone())),
            },
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Invariants & digests
    // -----------------------------------------------------------------------

    /// Verify the arena is a proper tree: every entry points at a live node
    /// whose back-reference matches, and every node is reachable from the
    /// root exactly once.
    pub fn check_invariants(&self) -> Result<(), TreeError> {
        let mut seen = 0usize;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            seen += 1;
            let node = self
                .nodes
                .get(&id)
                .ok_or_else(|| TreeError::Corrupt(format!("entry references missing {}", id)))?;
            if let Some(entries) = node.entries() {
                for (name, child) in entries {
                    let c = self.nodes.get(child).ok_or_else(|| {
                        TreeError::Corrupt(format!("{} references tombstoned {}", name, child))
                    })?;
                    if c.parent != Some(id) || c.name != *name {
                        return Err(TreeError::Corrupt(format!(
                            "back-reference of {} does not match entry {}",
                            child, name
                        )));
                    }
                    stack.push(*child);
                }
            }
            if seen > self.nodes.len() {
                return Err(TreeError::Corrupt("cycle detected".into()));
            }
        }
        if seen != self.nodes.len() {
            return Err(TreeError::Corrupt(format!(
                "{} unreachable nodes",
                self.nodes.len() - seen
            )));
        }
        Ok(())
    }

    /// SHA-256 over names, types, content and executable bits (not mtimes,
    /// not identities), so two snapshots with the same visible structure
    /// compare equal.
    pub fn structure_digest(&self) -> String {
        let mut hasher = Sha256::new();
        self.digest_node(self.root, &mut hasher);
        hex::encode(hasher.finalize())
    }

    fn digest_node(&self, id: NodeId, hasher: &mut Sha256) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        match &node.kind {
            NodeKind::Directory { entries } => {
                hasher.update(b"D(");
                for (name, child) in entries {
                    hasher.update((name.len() as u64).to_le_bytes());
                    hasher.update(name.as_bytes());
                    self.digest_node(*child, hasher);
                }
                hasher.update(b")");
            }
            NodeKind::File { data, executable } => {
                hasher.update(if *executable { b"X" } else { b"F" });
                hasher.update((data.len() as u64).to_le_bytes());
                hasher.update(data);
            }
            NodeKind::Symlink { target } => {
                hasher.update(b"S");
                hasher.update((target.len() as u64).to_le_bytes());
                hasher.update(target.as_bytes());
            }
        }
    }
}
