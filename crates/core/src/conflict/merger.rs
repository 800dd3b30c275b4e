//! Tree merger: builds the candidate snapshot for a commit.

use tracing::{debug, info};

use crate::errors::TreeError;
use crate::ops::Operation;
use crate::tree::Tree;

/// Stateless merge engine.
pub struct TreeMerger;

impl TreeMerger {
    /// Apply a resolved sequence to a copy of the merged head.
    ///
    /// The head is never touched. The candidate is checked against the arena
    /// invariants before it is returned, so a listing taken from it has no
    /// stale entries and no entries referencing tombstoned identities.
    pub fn merge(head: &Tree, ops: &[Operation]) -> Result<Tree, TreeError> {
        if ops.is_empty() {
            debug!("nothing to merge, candidate is the merged head");
            return Ok(head.clone());
        }

        info!(ops = ops.len(), "building candidate revision");
        let mut candidate = head.clone();
        for op in ops {
            candidate.apply(op)?;
        }
        candidate.check_invariants()?;
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeId;
    use crate::ops::{CreateKind, OpKind};

    fn create(parent: NodeId, name: &str) -> Operation {
        Operation::new(
            OpKind::Create {
                parent,
                name: name.into(),
                node: NodeId::new(),
                kind: CreateKind::File,
            },
            0,
        )
    }

    #[test]
    fn test_merge_leaves_head_untouched() {
        let head = Tree::empty();
        let candidate = TreeMerger::merge(&head, &[create(head.root(), "a")]).unwrap();
        assert!(head.is_empty());
        assert!(candidate.child(head.root(), "a").is_some());
    }

    #[test]
    fn test_merge_empty_sequence() {
        let head = Tree::empty();
        let candidate = TreeMerger::merge(&head, &[]).unwrap();
        assert_eq!(candidate.structure_digest(), head.structure_digest());
        assert_eq!(candidate.generation(), head.generation());
    }

    #[test]
    fn test_merge_fails_on_inapplicable_op() {
        let head = Tree::empty();
        let ops = vec![create(head.root(), "a"), create(head.root(), "a")];
        let err = TreeMerger::merge(&head, &ops).unwrap_err();
        assert_eq!(err, TreeError::AlreadyExists("a".into()));
    }
}
