//! Commit races, retry limits, and sequencer failures.
//!
//! The in-memory sequencer can hold a client's commit just before the
//! compare-and-swap, which makes the interleavings below deterministic.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use common::{assert_dir, assert_read, config, sync, users, users_with};
use treesync_core::branch::BranchState;
use treesync_core::errors::{ConflictError, SequencerError, SequencerOp, SyncError};
use treesync_core::models::{ClientId, Revision, RevisionDraft};
use treesync_core::sequencer::{MemorySequencer, PutOutcome, Sequencer};
use treesync_core::sync_engine::SyncEngine;

/// Delegates reads and rejects every commit.
struct RejectingSequencer {
    inner: MemorySequencer,
    puts: AtomicU32,
}

#[async_trait]
impl Sequencer for RejectingSequencer {
    async fn put(
        &self,
        _draft: RevisionDraft,
        _expected_parent: u64,
    ) -> Result<PutOutcome, SequencerError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(PutOutcome::Conflict {
            head: self.inner.head_seq() + 1,
        })
    }

    async fn revisions_since(&self, seq: u64) -> Result<Vec<Arc<Revision>>, SequencerError> {
        self.inner.revisions_since(seq).await
    }

    async fn head(&self) -> Result<Arc<Revision>, SequencerError> {
        self.inner.head().await
    }
}

// ===========================================================================
// Exclusive create races
// ===========================================================================

#[tokio::test]
async fn test_both_create_file_excl_parallel() -> anyhow::Result<()> {
    let (seq, c) = users(&["alice", "bob"]).await;
    let (alice, bob) = (c[0].clone(), c[1].clone());
    let bob_id = ClientId::new("bob");

    alice.mkdir("a").await?;
    sync(&bob).await;
    assert_dir(&bob, "a/", &[]);

    seq.stall_on_put(&bob_id);
    let task = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.create_exclusive("a/b").await })
    };
    seq.wait_for_stall(&bob_id).await;

    alice.create_exclusive("a/b").await?;
    assert_dir(&alice, "a/", &[("b", "FILE")]);
    seq.resume(&bob_id);

    let err = tokio::time::timeout(Duration::from_secs(5), task)
        .await??
        .unwrap_err();
    assert_eq!(err.to_string(), "b already exists");
    assert_dir(&bob, "a/", &[("b", "FILE")]);
    assert_eq!(bob.pending_ops(), 0);
    assert_eq!(bob.head_seq(), alice.head_seq());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_create_has_exactly_one_winner() -> anyhow::Result<()> {
    for round in 0..20 {
        let (_seq, c) = users(&["alice", "bob", "carol"]).await;
        c[0].mkdir("a").await?;
        for client in &c[1..] {
            sync(client).await;
        }

        let tasks: Vec<_> = c
            .iter()
            .cloned()
            .map(|client| tokio::spawn(async move { client.create_exclusive("a/x").await }))
            .collect();
        let mut winners = 0;
        for task in tasks {
            match task.await? {
                Ok(_) => winners += 1,
                Err(SyncError::Conflict(ConflictError::AlreadyExists { name, .. })) => {
                    assert_eq!(name, "x")
                }
                Err(other) => panic!("round {}: unexpected error {}", round, other),
            }
        }
        assert_eq!(winners, 1, "round {}", round);

        for client in &c {
            sync(client).await;
            assert_dir(client, "a", &[("x", "FILE")]);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_exclusive_create_lost_inside_shared_commit_pass() -> anyhow::Result<()> {
    let (seq, c) = users(&["alice", "bob"]).await;
    let (alice, bob) = (c[0].clone(), c[1].clone());
    let bob_id = ClientId::new("bob");

    alice.mkdir("a").await?;
    sync(&bob).await;

    // Bob's first pass holds the commit lock, stalled before its put.
    seq.stall_on_put(&bob_id);
    let writer = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.create_file("x", b"x").await })
    };
    seq.wait_for_stall(&bob_id).await;

    // Queued behind it; the stalled pass will pick this create up too.
    let creator = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.create_exclusive("a/b").await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while bob.pending_ops() < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await?;

    let winner = alice.create_exclusive("a/b").await?;
    seq.resume(&bob_id);

    tokio::time::timeout(Duration::from_secs(5), writer).await???;
    let err = tokio::time::timeout(Duration::from_secs(5), creator)
        .await??
        .unwrap_err();
    match err {
        SyncError::Conflict(ConflictError::AlreadyExists { path, name }) => {
            assert_eq!(path, "a/b");
            assert_eq!(name, "b");
        }
        other => panic!("expected AlreadyExists, got {}", other),
    }

    assert_eq!(bob.lookup("a/b")?, winner);
    assert_dir(&bob, "a", &[("b", "FILE")]);
    assert_read(&bob, "x", b"x");
    assert_eq!(bob.pending_ops(), 0);
    sync(&alice).await;
    assert_read(&alice, "x", b"x");
    Ok(())
}

#[tokio::test]
async fn test_mutations_queued_behind_a_stalled_pass_all_commit() -> anyhow::Result<()> {
    let (seq, c) = users(&["alice", "bob"]).await;
    let (alice, bob) = (c[0].clone(), c[1].clone());
    let bob_id = ClientId::new("bob");

    seq.stall_on_put(&bob_id);
    let first = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.write("f", 0, b"one").await })
    };
    seq.wait_for_stall(&bob_id).await;
    let second = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.write("g", 0, b"two").await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while bob.pending_ops() < 4 {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    assert_read(&bob, "g", b"two");

    seq.resume(&bob_id);
    first.await??;
    second.await??;

    assert_eq!(bob.pending_ops(), 0);
    assert_eq!(seq.head_seq(), 2);
    assert_eq!(bob.head_seq(), seq.head_seq());
    sync(&alice).await;
    assert_read(&alice, "f", b"one");
    assert_read(&alice, "g", b"two");
    Ok(())
}

// ===========================================================================
// Retry loop
// ===========================================================================

#[tokio::test]
async fn test_lost_commit_race_is_retried() -> anyhow::Result<()> {
    let (seq, c) = users(&["alice", "bob"]).await;
    let (alice, bob) = (c[0].clone(), c[1].clone());
    let bob_id = ClientId::new("bob");

    alice.create_file("a/b", b"hello").await?;
    sync(&bob).await;
    bob.disable_updates()?;
    bob.write("a/c", 0, b"bob").await?;

    seq.stall_on_put(&bob_id);
    let task = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.reenable_updates().await })
    };
    seq.wait_for_stall(&bob_id).await;
    assert!(bob.is_resolving());
    assert_eq!(bob.branch_state(), BranchState::Resolving);

    alice.write("a/d", 0, b"alice").await?;
    seq.resume(&bob_id);

    let report = task.await??;
    assert_eq!(report.attempts, 2);
    assert_eq!(report.committed, Some(seq.head_seq()));
    assert!(!bob.is_resolving());

    sync(&alice).await;
    for client in [&alice, &bob] {
        assert_dir(client, "a", &[("b", "FILE"), ("c", "FILE"), ("d", "FILE")]);
        assert_read(client, "a/c", b"bob");
        assert_read(client, "a/d", b"alice");
    }
    Ok(())
}

#[tokio::test]
async fn test_retry_cap_exceeded_keeps_log() -> anyhow::Result<()> {
    let rejecting = Arc::new(RejectingSequencer {
        inner: MemorySequencer::new(),
        puts: AtomicU32::new(0),
    });
    let mut cfg = config();
    cfg.resolver.max_commit_retries = 3;
    let bob = SyncEngine::checkout(ClientId::new("bob"), rejecting.clone(), cfg).await?;

    bob.disable_updates()?;
    bob.create_file("f", b"data").await?;

    let err = bob.reenable_updates().await.unwrap_err();
    assert!(matches!(err, SyncError::RetryCapExceeded { attempts: 4 }));
    assert_eq!(rejecting.puts.load(Ordering::SeqCst), 4);
    assert_eq!(bob.branch_state(), BranchState::Unmerged);
    assert_eq!(bob.pending_ops(), 2);
    assert_read(&bob, "f", b"data");
    assert!(!bob.is_resolving());
    Ok(())
}

#[tokio::test]
async fn test_reenable_is_single_flight() -> anyhow::Result<()> {
    let (seq, c) = users(&["bob"]).await;
    let bob = c[0].clone();
    let bob_id = ClientId::new("bob");

    bob.disable_updates()?;
    bob.create_file("f", b"one").await?;

    seq.stall_on_put(&bob_id);
    let first = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.reenable_updates().await })
    };
    seq.wait_for_stall(&bob_id).await;

    match bob.reenable_updates().await {
        Err(SyncError::AlreadyRunning { client }) => assert_eq!(client, "bob"),
        other => panic!("expected AlreadyRunning, got {:?}", other.map(|r| r.committed)),
    }

    // Queued during resolution, committed before re-enable returns.
    bob.create_file("g", b"two").await?;
    assert_eq!(bob.branch_state(), BranchState::Resolving);

    seq.resume(&bob_id);
    first.await??;
    assert_eq!(bob.branch_state(), BranchState::Merged);
    assert_eq!(bob.pending_ops(), 0);
    assert_eq!(bob.head_seq(), seq.head_seq());
    assert_dir(&bob, "", &[("f", "FILE"), ("g", "FILE")]);
    Ok(())
}

// ===========================================================================
// Sequencer failures
// ===========================================================================

#[tokio::test]
async fn test_pruned_history_is_fatal() -> anyhow::Result<()> {
    let (seq, c) = users(&["alice", "bob"]).await;
    let (alice, bob) = (&c[0], &c[1]);

    alice.create_file("a/b", b"hello").await?;
    sync(bob).await;
    bob.disable_updates()?;
    alice.write("a/c", 0, b"1").await?;
    alice.write("a/d", 0, b"2").await?;
    seq.prune_before(seq.head_seq());

    bob.write("a/e", 0, b"3").await?;
    let err = bob.reenable_updates().await.unwrap_err();
    assert!(err.is_fatal(), "unexpected error {}", err);
    assert!(matches!(err, SyncError::FatalDivergence { base: 1, .. }));
    assert_eq!(bob.branch_state(), BranchState::Unmerged);
    Ok(())
}

#[tokio::test]
async fn test_unavailable_sequencer_leaves_branch_unmerged() -> anyhow::Result<()> {
    let (seq, c) = users(&["alice", "bob"]).await;
    let (alice, bob) = (&c[0], &c[1]);

    alice.create_file("a/b", b"hello").await?;
    sync(bob).await;
    bob.disable_updates()?;
    bob.write("a/c", 0, b"world").await?;

    seq.inject_fault(
        SequencerOp::RevisionsSince,
        SequencerError::Unavailable("connection reset".into()),
    );
    let err = bob.reenable_updates().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Sequencer(SequencerError::Unavailable(_))
    ));
    assert_eq!(bob.branch_state(), BranchState::Unmerged);
    assert_eq!(bob.pending_ops(), 2);

    // The fault was one-shot; the next attempt goes through.
    bob.reenable_updates().await?;
    sync(alice).await;
    assert_read(alice, "a/c", b"world");
    Ok(())
}

#[tokio::test]
async fn test_failed_put_keeps_operation_queued() -> anyhow::Result<()> {
    let (seq, c) = users(&["alice", "bob"]).await;
    let (alice, bob) = (&c[0], &c[1]);

    alice.create_file("a/b", b"hello").await?;
    sync(bob).await;

    seq.fail_next(SequencerOp::Put, "disk full");
    let err = bob.write("a/b", 0, b"HELLO").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Sequencer(SequencerError::Injected {
            op: SequencerOp::Put,
            ..
        })
    ));
    assert_eq!(bob.branch_state(), BranchState::Merged);
    assert_eq!(bob.pending_ops(), 1);
    assert_read(bob, "a/b", b"HELLO");

    sync(bob).await;
    assert_eq!(bob.pending_ops(), 0);
    sync(alice).await;
    assert_read(alice, "a/b", b"HELLO");
    Ok(())
}

#[tokio::test]
async fn test_sequencer_timeout_keeps_operation_queued() -> anyhow::Result<()> {
    let mut cfg = config();
    cfg.sequencer.timeout_ms = 50;
    let (seq, c) = users_with(&["alice", "bob"], cfg).await;
    let (alice, bob) = (&c[0], &c[1]);
    let bob_id = ClientId::new("bob");

    alice.create_file("a/b", b"hello").await?;
    sync(bob).await;

    seq.stall_on_put(&bob_id);
    let err = bob.write("a/b", 0, b"HELLO").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Sequencer(SequencerError::Timeout {
            op: SequencerOp::Put,
            timeout_ms: 50
        })
    ));
    assert_eq!(bob.pending_ops(), 1);
    assert_read(bob, "a/b", b"HELLO");

    seq.resume(&bob_id);
    sync(bob).await;
    assert_eq!(bob.pending_ops(), 0);
    sync(alice).await;
    assert_read(alice, "a/b", b"HELLO");
    Ok(())
}

#[tokio::test]
async fn test_local_reads_do_not_wait_on_commit() -> anyhow::Result<()> {
    let (seq, c) = users(&["bob"]).await;
    let bob = c[0].clone();
    let bob_id = ClientId::new("bob");

    bob.create_file("a/b", b"hello").await?;
    seq.stall_on_put(&bob_id);
    let task = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.write("a/b", 0, b"world").await })
    };
    seq.wait_for_stall(&bob_id).await;

    assert_read(&bob, "a/b", b"world");
    assert_dir(&bob, "a", &[("b", "FILE")]);
    assert_eq!(bob.pending_ops(), 1);

    seq.resume(&bob_id);
    task.await??;
    assert_eq!(bob.pending_ops(), 0);
    Ok(())
}

#[tokio::test]
async fn test_checkout_lenient_presents_empty_root() -> anyhow::Result<()> {
    let seq = Arc::new(MemorySequencer::new());
    seq.inject_fault(
        SequencerOp::Head,
        SequencerError::PermissionDenied("carol may not read this tree".into()),
    );

    let strict = SyncEngine::checkout(ClientId::new("carol"), seq.clone(), config()).await;
    assert!(matches!(
        strict,
        Err(SyncError::Sequencer(SequencerError::PermissionDenied(_)))
    ));

    seq.inject_fault(
        SequencerOp::Head,
        SequencerError::PermissionDenied("carol may not read this tree".into()),
    );
    let lenient =
        SyncEngine::checkout_lenient(ClientId::new("carol"), seq.clone(), config()).await?;
    assert_dir(&lenient, "", &[]);
    assert_eq!(lenient.head_seq(), 0);
    Ok(())
}
