//! Branch tracking: the per-client state machine and the unmerged operation
//! log.

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::ops::Operation;

// ---------------------------------------------------------------------------
// Branch state machine
// ---------------------------------------------------------------------------

/// Where a client stands relative to the shared history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    /// Following the merged branch; mutations are committed as they happen.
    Merged,
    /// Updates disabled; mutations queue in the unmerged log.
    Unmerged,
    /// A resolution cycle is reconciling the unmerged log.
    Resolving,
}

impl BranchState {
    /// Validate and perform a transition.
    ///
    /// `Merged -> Unmerged -> Resolving -> Merged`, plus `Resolving ->
    /// Unmerged` when a cycle fails and the log has to wait for the next
    /// attempt.
    pub fn transition(self, to: BranchState) -> Result<BranchState, SyncError> {
        use BranchState::*;
        match (self, to) {
            (Merged, Unmerged) | (Unmerged, Resolving) | (Resolving, Merged)
            | (Resolving, Unmerged) => Ok(to),
            _ => Err(SyncError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            }),
        }
    }

    /// Whether mutations are queued instead of committed.
    pub fn is_diverged(self) -> bool {
        !matches!(self, BranchState::Merged)
    }
}

impl std::fmt::Display for BranchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merged => write!(f, "merged"),
            Self::Unmerged => write!(f, "unmerged"),
            Self::Resolving => write!(f, "resolving"),
        }
    }
}

// ---------------------------------------------------------------------------
// Operation log
// ---------------------------------------------------------------------------

/// Ordered operations recorded since the divergence point.
///
/// The log itself is not synchronized; the sync engine keeps it inside its
/// per-client state lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationLog {
    ops: Vec<Operation>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    /// Copy of the pending operations, for handing to the resolver.
    pub fn snapshot(&self) -> Vec<Operation> {
        self.ops.clone()
    }

    /// Remove the first `n` operations (the ones a commit consumed) and
    /// return them. Operations appended after the snapshot stay queued.
    pub fn drain_front(&mut self, n: usize) -> Vec<Operation> {
        let n = n.min(self.ops.len());
        self.ops.drain(..n).collect()
    }

    /// JSON rendering of the log, for diagnostics.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.ops)
    }
}
