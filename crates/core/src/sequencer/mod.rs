//! The metadata sequencer: total order and compare-and-swap commits.
//!
//! The real sequencer is a remote service; the engine only talks to it
//! through the [`Sequencer`] trait. [`memory::MemorySequencer`] is the
//! in-process implementation used by tests and single-process setups.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::SequencerError;
use crate::models::{Revision, RevisionDraft};

pub use memory::MemorySequencer;

/// Result of a compare-and-swap commit.
#[derive(Debug, Clone)]
pub enum PutOutcome {
    /// The draft became the new head.
    Accepted(Arc<Revision>),
    /// Another revision already extends the expected parent.
    Conflict { head: u64 },
}

/// Sequencer operations the engine depends on.
#[async_trait]
pub trait Sequencer: Send + Sync {
    /// Commit `draft` as the child of `expected_parent`, or report that the
    /// head has moved on.
    async fn put(
        &self,
        draft: RevisionDraft,
        expected_parent: u64,
    ) -> Result<PutOutcome, SequencerError>;

    /// All revisions with a sequence number greater than `seq`, in order.
    async fn revisions_since(&self, seq: u64) -> Result<Vec<Arc<Revision>>, SequencerError>;

    /// The current head.
    async fn head(&self) -> Result<Arc<Revision>, SequencerError>;
}
