//! In-memory sequencer with deterministic test controls.
//!
//! Besides the [`Sequencer`] operations it exposes the control surface the
//! race tests drive:
//! 1. `stall_on_put` / `wait_for_stall` / `resume` hold one client's next
//!    commit just before the compare-and-swap
//! 2. `inject_fault` / `fail_next` fail the next call of a named operation
//! 3. `prune_before` drops old history

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{PutOutcome, Sequencer};
use crate::errors::{SequencerError, SequencerOp};
use crate::models::{ClientId, Revision, RevisionDraft};
use crate::tree::Tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StallPhase {
    Armed,
    Stalled,
    Released,
}

#[derive(Default)]
struct Inner {
    /// Retained history, oldest first. Never empty.
    revisions: Vec<Arc<Revision>>,
    stalls: HashMap<ClientId, Arc<watch::Sender<StallPhase>>>,
    faults: HashMap<SequencerOp, SequencerError>,
}

impl Inner {
    fn head(&self) -> Arc<Revision> {
        // `revisions` is seeded with the initial revision and pruning keeps
        // the head.
        Arc::clone(&self.revisions[self.revisions.len() - 1])
    }

    fn take_fault(&mut self, op: SequencerOp) -> Result<(), SequencerError> {
        match self.faults.remove(&op) {
            Some(err) => {
                debug!(op = %op, error = %err, "injected sequencer fault fired");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

/// Process-local sequencer.
pub struct MemorySequencer {
    inner: Mutex<Inner>,
}

impl MemorySequencer {
    /// A sequencer whose history starts with an empty tree.
    pub fn new() -> Self {
        Self::with_root(Tree::empty())
    }

    /// A sequencer whose initial revision holds `tree`.
    pub fn with_root(tree: Tree) -> Self {
        let initial = Revision::initial(ClientId::new("sequencer"), tree);
        Self {
            inner: Mutex::new(Inner {
                revisions: vec![Arc::new(initial)],
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sequence number of the current head.
    pub fn head_seq(&self) -> u64 {
        self.lock().head().seq
    }

    // -----------------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------------

    /// Hold `client`'s next `put` right before the compare-and-swap.
    pub fn stall_on_put(&self, client: &ClientId) {
        let (tx, _rx) = watch::channel(StallPhase::Armed);
        self.lock().stalls.insert(client.clone(), Arc::new(tx));
        debug!(client = %client, "armed put stall");
    }

    /// Wait until `client`'s `put` has reached the stall. Returns at once if
    /// no stall is armed.
    pub async fn wait_for_stall(&self, client: &ClientId) {
        let gate = self.lock().stalls.get(client).cloned();
        if let Some(gate) = gate {
            let mut rx = gate.subscribe();
            // The sender is kept alive by `gate`, so this cannot fail.
            let _ = rx.wait_for(|p| *p != StallPhase::Armed).await;
        }
    }

    /// Release a stalled (or armed) `put` for `client`.
    pub fn resume(&self, client: &ClientId) {
        if let Some(gate) = self.lock().stalls.remove(client) {
            gate.send_replace(StallPhase::Released);
            debug!(client = %client, "released put stall");
        }
    }

    /// Fail the next call of `op` with `err`.
    pub fn inject_fault(&self, op: SequencerOp, err: SequencerError) {
        self.lock().faults.insert(op, err);
    }

    /// Fail the next call of `op` with a generic [`SequencerError::Injected`].
    pub fn fail_next(&self, op: SequencerOp, detail: impl Into<String>) {
        self.inject_fault(
            op,
            SequencerError::Injected {
                op,
                detail: detail.into(),
            },
        );
    }

    /// Forget every revision older than `seq`. The head is always kept.
    pub fn prune_before(&self, seq: u64) {
        let mut inner = self.lock();
        let cutoff = seq.min(inner.head().seq);
        inner.revisions.retain(|r| r.seq >= cutoff);
        info!(before = cutoff, "pruned sequencer history");
    }
}

impl Default for MemorySequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sequencer for MemorySequencer {
    async fn put(
        &self,
        draft: RevisionDraft,
        expected_parent: u64,
    ) -> Result<PutOutcome, SequencerError> {
        let gate = {
            let mut inner = self.lock();
            inner.take_fault(SequencerOp::Put)?;
            inner
                .stalls
                .get(&draft.writer)
                .filter(|g| *g.borrow() == StallPhase::Armed)
                .cloned()
        };

        if let Some(gate) = gate {
            let mut rx = gate.subscribe();
            gate.send_if_modified(|phase| {
                let arm = *phase == StallPhase::Armed;
                if arm {
                    *phase = StallPhase::Stalled;
                }
                arm
            });
            debug!(client = %draft.writer, "put stalled");
            let _ = rx.wait_for(|p| *p == StallPhase::Released).await;
        }

        let mut inner = self.lock();
        let head = inner.head();
        if head.seq != expected_parent {
            debug!(
                client = %draft.writer,
                expected_parent,
                head = head.seq,
                "put rejected"
            );
            return Ok(PutOutcome::Conflict { head: head.seq });
        }

        let digest = draft.tree.structure_digest();
        let revision = Arc::new(Revision {
            seq: head.seq + 1,
            parent: Some(head.seq),
            writer: draft.writer,
            tree: draft.tree,
            ops: draft.ops,
            digest,
            committed_at: Utc::now(),
        });
        inner.revisions.push(Arc::clone(&revision));
        info!(
            seq = revision.seq,
            writer = %revision.writer,
            ops = revision.ops.len(),
            "revision accepted"
        );
        Ok(PutOutcome::Accepted(revision))
    }

    async fn revisions_since(&self, seq: u64) -> Result<Vec<Arc<Revision>>, SequencerError> {
        let mut inner = self.lock();
        inner.take_fault(SequencerOp::RevisionsSince)?;
        let available_from = inner.revisions[0].seq;
        if seq + 1 < available_from {
            return Err(SequencerError::Pruned {
                seq,
                available_from,
            });
        }
        Ok(inner
            .revisions
            .iter()
            .filter(|r| r.seq > seq)
            .cloned()
            .collect())
    }

    async fn head(&self) -> Result<Arc<Revision>, SequencerError> {
        let mut inner = self.lock();
        inner.take_fault(SequencerOp::Head)?;
        Ok(inner.head())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn draft(writer: &str) -> RevisionDraft {
        RevisionDraft {
            writer: ClientId::new(writer),
            tree: Arc::new(Tree::empty()),
            ops: Vec::new(),
        }
    }

    fn accepted(outcome: PutOutcome) -> Arc<Revision> {
        match outcome {
            PutOutcome::Accepted(rev) => rev,
            PutOutcome::Conflict { head } => panic!("unexpected conflict at {}", head),
        }
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let seq = MemorySequencer::new();
        let rev = accepted(seq.put(draft("alice"), 0).await.unwrap());
        assert_eq!(rev.seq, 1);
        assert_eq!(rev.parent, Some(0));

        match seq.put(draft("bob"), 0).await.unwrap() {
            PutOutcome::Conflict { head } => assert_eq!(head, 1),
            PutOutcome::Accepted(_) => panic!("second child of r0 accepted"),
        }
        assert_eq!(seq.head_seq(), 1);
    }

    #[tokio::test]
    async fn test_revisions_since() {
        let seq = MemorySequencer::new();
        for parent in 0..3 {
            seq.put(draft("alice"), parent).await.unwrap();
        }
        let revs = seq.revisions_since(1).await.unwrap();
        let seqs: Vec<u64> = revs.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(seq.revisions_since(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pruned_history() {
        let seq = MemorySequencer::new();
        for parent in 0..4 {
            seq.put(draft("alice"), parent).await.unwrap();
        }
        seq.prune_before(3);
        let err = seq.revisions_since(0).await.unwrap_err();
        assert_eq!(
            err,
            SequencerError::Pruned {
                seq: 0,
                available_from: 3
            }
        );
        // r2 itself is gone but everything after it is still there.
        assert_eq!(seq.revisions_since(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let seq = MemorySequencer::new();
        seq.inject_fault(
            SequencerOp::Head,
            SequencerError::PermissionDenied("alice".into()),
        );
        assert!(seq.head().await.is_err());
        assert!(seq.head().await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_next_names_the_operation() {
        let seq = MemorySequencer::new();
        seq.fail_next(SequencerOp::Put, "disk full");
        // Other operations are unaffected.
        assert!(seq.head().await.is_ok());
        let err = seq.put(draft("alice"), 0).await.unwrap_err();
        assert_eq!(
            err,
            SequencerError::Injected {
                op: SequencerOp::Put,
                detail: "disk full".into()
            }
        );
        assert_eq!(err.to_string(), "injected fault on sequencer put: disk full");
        assert_eq!(accepted(seq.put(draft("alice"), 0).await.unwrap()).seq, 1);
    }

    #[tokio::test]
    async fn test_stall_and_resume() {
        let seq = Arc::new(MemorySequencer::new());
        let bob = ClientId::new("bob");
        seq.stall_on_put(&bob);

        let task = {
            let seq = Arc::clone(&seq);
            tokio::spawn(async move { seq.put(draft("bob"), 0).await })
        };
        seq.wait_for_stall(&bob).await;

        // Alice commits while bob is held.
        accepted(seq.put(draft("alice"), 0).await.unwrap());

        seq.resume(&bob);
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, PutOutcome::Conflict { head: 1 }));
    }
}
