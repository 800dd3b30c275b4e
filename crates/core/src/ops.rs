//! Operation log records.
//!
//! Operations are the structured, replayable form of every mutation. They
//! name their targets by [`NodeId`] rather than by path, which is what lets
//! the resolver follow a node across renames made by the other branch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::NodeId;

/// What kind of node a `Create` makes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateKind {
    File,
    Directory,
    Symlink { target: String },
}

impl CreateKind {
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory)
    }
}

/// Attribute changed by `SetAttr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "attr", content = "value", rename_all = "snake_case")]
pub enum Attr {
    Mtime(DateTime<Utc>),
    Executable(bool),
}

/// The tagged operation variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    Create {
        parent: NodeId,
        name: String,
        node: NodeId,
        kind: CreateKind,
    },
    /// Create a regular file, failing if the name is taken.
    ExclusiveCreate {
        parent: NodeId,
        name: String,
        node: NodeId,
    },
    Remove {
        parent: NodeId,
        name: String,
        node: NodeId,
    },
    Rename {
        node: NodeId,
        src_parent: NodeId,
        src_name: String,
        dst_parent: NodeId,
        dst_name: String,
    },
    Write {
        node: NodeId,
        offset: u64,
        data: Vec<u8>,
    },
    Truncate {
        node: NodeId,
        size: u64,
    },
    SetAttr {
        node: NodeId,
        attr: Attr,
    },
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(flatten)]
    pub kind: OpKind,
    /// Sequence number of the revision the operation was recorded against.
    pub origin: u64,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    pub fn new(kind: OpKind, origin: u64) -> Self {
        Self {
            kind,
            origin,
            timestamp: Utc::now(),
        }
    }

    /// Derive a synthesized operation carrying this one's origin and time.
    pub fn derive(&self, kind: OpKind) -> Self {
        Self {
            kind,
            origin: self.origin,
            timestamp: self.timestamp,
        }
    }

    /// Short name, used in logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self.kind {
            OpKind::Create { .. } => "create",
            OpKind::ExclusiveCreate { .. } => "exclusive_create",
            OpKind::Remove { .. } => "remove",
            OpKind::Rename { .. } => "rename",
            OpKind::Write { .. } => "write",
            OpKind::Truncate { .. } => "truncate",
            OpKind::SetAttr { .. } => "setattr",
        }
    }

    /// The node the operation acts on.
    pub fn target(&self) -> NodeId {
        match &self.kind {
            OpKind::Create { node, .. }
            | OpKind::ExclusiveCreate { node, .. }
            | OpKind::Remove { node, .. }
            | OpKind::Rename { node, .. }
            | OpKind::Write { node, .. }
            | OpKind::Truncate { node, .. }
            | OpKind::SetAttr { node, .. } => *node,
        }
    }

    /// Every identity the operation references, target first.
    pub fn identities(&self) -> Vec<NodeId> {
        match &self.kind {
            OpKind::Create { parent, node, .. }
            | OpKind::ExclusiveCreate { parent, node, .. }
            | OpKind::Remove { parent, node, .. } => vec![*node, *parent],
            OpKind::Rename {
                node,
                src_parent,
                dst_parent,
                ..
            } => vec![*node, *src_parent, *dst_parent],
            OpKind::Write { node, .. }
            | OpKind::Truncate { node, .. }
            | OpKind::SetAttr { node, .. } => vec![*node],
        }
    }

    /// Whether this operation gives its target non-empty content.
    pub fn adds_content(&self) -> bool {
        match &self.kind {
            OpKind::Write { data, .. } => !data.is_empty(),
            OpKind::Truncate { size, .. } => *size > 0,
            _ => false,
        }
    }

    /// Rewrite every identity through `f`.
    pub fn map_ids(&self, f: impl Fn(NodeId) -> NodeId) -> Self {
        let kind = match &self.kind {
            OpKind::Create {
                parent,
                name,
                node,
                kind,
            } => OpKind::Create {
                parent: f(*parent),
                name: name.clone(),
                node: f(*node),
                kind: kind.clone(),
            },
            OpKind::ExclusiveCreate { parent, name, node } => OpKind::ExclusiveCreate {
                parent: f(*parent),
                name: name.clone(),
                node: f(*node),
            },
            OpKind::Remove { parent, name, node } => OpKind::Remove {
                parent: f(*parent),
                name: name.clone(),
                node: f(*node),
            },
            OpKind::Rename {
                node,
                src_parent,
                src_name,
                dst_parent,
                dst_name,
            } => OpKind::Rename {
                node: f(*node),
                src_parent: f(*src_parent),
                src_name: src_name.clone(),
                dst_parent: f(*dst_parent),
                dst_name: dst_name.clone(),
            },
            OpKind::Write { node, offset, data } => OpKind::Write {
                node: f(*node),
                offset: *offset,
                data: data.clone(),
            },
            OpKind::Truncate { node, size } => OpKind::Truncate {
                node: f(*node),
                size: *size,
            },
            OpKind::SetAttr { node, attr } => OpKind::SetAttr {
                node: f(*node),
                attr: attr.clone(),
            },
        };
        self.derive(kind)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OpKind::Create { name, node, .. } | OpKind::ExclusiveCreate { name, node, .. } => {
                write!(f, "{} {} ({})", self.name(), name, node)
            }
            OpKind::Remove { name, node, .. } => write!(f, "remove {} ({})", name, node),
            OpKind::Rename {
                node,
                src_name,
                dst_name,
                ..
            } => write!(f, "rename {} -> {} ({})", src_name, dst_name, node),
            OpKind::Write { node, offset, data } => {
                write!(f, "write {}B @{} ({})", data.len(), offset, node)
            }
            OpKind::Truncate { node, size } => write!(f, "truncate {} ({})", size, node),
            OpKind::SetAttr { node, attr } => write!(f, "setattr {:?} ({})", attr, node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adds_content() {
        let node = NodeId::new();
        let write = Operation::new(
            OpKind::Write {
                node,
                offset: 0,
                data: b"hi".to_vec(),
            },
            1,
        );
        let empty_write = Operation::new(
            OpKind::Write {
                node,
                offset: 0,
                data: Vec::new(),
            },
            1,
        );
        let grow = Operation::new(OpKind::Truncate { node, size: 10 }, 1);
        let shrink = Operation::new(OpKind::Truncate { node, size: 0 }, 1);
        assert!(write.adds_content());
        assert!(!empty_write.adds_content());
        assert!(grow.adds_content());
        assert!(!shrink.adds_content());
    }

    #[test]
    fn test_map_ids_rewrites_every_reference() {
        let (node, from, to) = (NodeId::new(), NodeId::new(), NodeId::new());
        let op = Operation::new(
            OpKind::Rename {
                node,
                src_parent: from,
                src_name: "a".into(),
                dst_parent: from,
                dst_name: "b".into(),
            },
            3,
        );
        let mapped = op.map_ids(|id| if id == from { to } else { id });
        assert_eq!(mapped.identities(), vec![node, to, to]);
        assert_eq!(mapped.origin, 3);
        assert_eq!(mapped.timestamp, op.timestamp);
    }

    #[test]
    fn test_serializes_as_tagged_record() {
        let op = Operation::new(
            OpKind::Truncate {
                node: NodeId::new(),
                size: 4,
            },
            7,
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "truncate");
        assert_eq!(json["size"], 4);
        assert_eq!(json["origin"], 7);
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
