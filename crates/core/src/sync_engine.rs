//! Per-client synchronization engine.
//!
//! A [`SyncEngine`] is one client's view of the shared tree. It serves local
//! reads and writes against its own tree and moves through the branch state
//! machine:
//!
//! 1. **Merged**: every mutation is recorded and committed right away
//!    through the resolve-and-commit loop.
//! 2. **Unmerged** (after [`SyncEngine::disable_updates`]): mutations only
//!    append to the operation log; the revision at that point is the
//!    divergence point.
//! 3. **Resolving** (inside [`SyncEngine::reenable_updates`]): the log is
//!    resolved against everything committed since the divergence point and
//!    committed under compare-and-swap, retrying on lost races.
//!
//! All per-client context lives in the engine itself, so any number of
//! clients can run side by side in one process. Only one resolution cycle
//! runs per client at a time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::branch::{BranchState, OperationLog};
use crate::config::SyncConfig;
use crate::conflict::{Conflict, ConflictResolver, LostExclusive, ResolveInput, TreeMerger};
use crate::errors::{ConflictError, SequencerError, SequencerOp, SyncError, TreeError};
use crate::identity::{join, parent_and_name, split_path, PathResolver};
use crate::models::{ClientId, DirEntry, NodeId, Revision, RevisionDraft, Stat};
use crate::ops::{Attr, CreateKind, OpKind, Operation};
use crate::sequencer::{PutOutcome, Sequencer};
use crate::tree::{NodeKind, Tree};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of one or more commit passes.
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    /// Sequence number of the last revision this client committed.
    pub committed: Option<u64>,
    /// Resolve-and-commit attempts made, including rejected ones.
    pub attempts: u32,
    /// Conflicts resolved along the way.
    pub conflicts: Vec<Conflict>,
    /// Exclusive creates that lost their name.
    pub lost_exclusive: Vec<LostExclusive>,
}

impl ResolutionReport {
    /// The lost exclusive creates as user-visible errors.
    pub fn errors(&self) -> Vec<ConflictError> {
        self.lost_exclusive
            .iter()
            .map(LostExclusive::to_error)
            .collect()
    }

    fn absorb(&mut self, other: ResolutionReport) {
        self.committed = other.committed.or(self.committed);
        self.attempts += other.attempts;
        self.conflicts.extend(other.conflicts);
        self.lost_exclusive.extend(other.lost_exclusive);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct ClientState {
    branch: BranchState,
    /// Last merged revision installed; the divergence point while diverged.
    head: Arc<Revision>,
    /// `head` plus every queued operation.
    local: Tree,
    log: OperationLog,
    /// Exclusive creates found lost by any commit pass, until their caller
    /// picks them up.
    lost: HashMap<NodeId, LostExclusive>,
}

/// One client of the shared tree.
pub struct SyncEngine {
    client: ClientId,
    config: SyncConfig,
    sequencer: Arc<dyn Sequencer>,
    /// Never held across an `.await`.
    state: Mutex<ClientState>,
    paths: PathResolver,
    /// Serializes commit passes of this client.
    commit_lock: tokio::sync::Mutex<()>,
    /// Atomic flag making re-enable single-flight.
    resolving: Arc<AtomicBool>,
}

impl SyncEngine {
    /// Check out the sequencer's current head.
    pub async fn checkout(
        client: ClientId,
        sequencer: Arc<dyn Sequencer>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let head = bounded(
            config.sequencer.timeout(),
            SequencerOp::Head,
            sequencer.head(),
        )
        .await?;
        info!(client = %client, seq = head.seq, "checked out merged head");
        Ok(Self::from_head(client, sequencer, config, head))
    }

    /// Like [`checkout`](Self::checkout), but a client the sequencer refuses
    /// to serve gets an empty root instead of an error.
    pub async fn checkout_lenient(
        client: ClientId,
        sequencer: Arc<dyn Sequencer>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        match bounded(
            config.sequencer.timeout(),
            SequencerOp::Head,
            sequencer.head(),
        )
        .await
        {
            Ok(head) => {
                info!(client = %client, seq = head.seq, "checked out merged head");
                Ok(Self::from_head(client, sequencer, config, head))
            }
            Err(SequencerError::PermissionDenied(detail)) => {
                warn!(client = %client, detail, "no access to tree, presenting an empty root");
                let empty = Arc::new(Revision::initial(client.clone(), Tree::empty()));
                Ok(Self::from_head(client, sequencer, config, empty))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn from_head(
        client: ClientId,
        sequencer: Arc<dyn Sequencer>,
        config: SyncConfig,
        head: Arc<Revision>,
    ) -> Self {
        Self {
            client,
            config,
            sequencer,
            state: Mutex::new(ClientState {
                branch: BranchState::Merged,
                local: (*head.tree).clone(),
                head,
                log: OperationLog::new(),
                lost: HashMap::new(),
            }),
            paths: PathResolver::new(),
            commit_lock: tokio::sync::Mutex::new(()),
            resolving: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn timed<T, F>(&self, op: SequencerOp, fut: F) -> Result<T, SequencerError>
    where
        F: Future<Output = Result<T, SequencerError>>,
    {
        bounded(self.config.sequencer.timeout(), op, fut).await
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn branch_state(&self) -> BranchState {
        self.state().branch
    }

    /// Sequence number of the last merged revision this client installed.
    pub fn head_seq(&self) -> u64 {
        self.state().head.seq
    }

    pub fn pending_ops(&self) -> usize {
        self.state().log.len()
    }

    /// Copy of the queued operations.
    pub fn pending_log(&self) -> Vec<Operation> {
        self.state().log.snapshot()
    }

    pub fn is_resolving(&self) -> bool {
        self.resolving.load(Ordering::SeqCst)
    }

    /// Copy of the local tree, pending operations included.
    pub fn local_tree(&self) -> Tree {
        self.state().local.clone()
    }

    // -----------------------------------------------------------------------
    // Branch control
    // -----------------------------------------------------------------------

    /// Stop committing. Mutations queue locally from here on, and the
    /// current head becomes the divergence point.
    pub fn disable_updates(&self) -> Result<(), SyncError> {
        let mut state = self.state();
        state.branch = state.branch.transition(BranchState::Unmerged)?;
        info!(
            client = %self.client,
            divergence = state.head.seq,
            queued = state.log.len(),
            "updates disabled"
        );
        Ok(())
    }

    /// Resolve the unmerged branch against the merged branch and commit it.
    ///
    /// On success the client is back in `Merged` state and fast-forwarded to
    /// the sequencer head. On failure it stays `Unmerged` with its log intact,
    /// except for [`SyncError::FatalDivergence`], after which the session has
    /// to start over from a fresh checkout.
    pub async fn reenable_updates(&self) -> Result<ResolutionReport, SyncError> {
        if self
            .resolving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning {
                client: self.client.to_string(),
            });
        }

        // RAII guard that clears the resolving flag on drop (even on panic).
        let _guard = ResolveLockGuard(self.resolving.clone());

        {
            let mut state = self.state();
            state.branch = state.branch.transition(BranchState::Resolving)?;
            info!(
                client = %self.client,
                divergence = state.head.seq,
                pending = state.log.len(),
                "re-enabling updates"
            );
        }

        let _commit = self.commit_lock.lock().await;
        let mut report = match self.commit_pending().await {
            Ok(report) => report,
            Err(err) => {
                self.settle(BranchState::Unmerged);
                warn!(client = %self.client, error = %err, "resolution failed, updates stay disabled");
                return Err(err);
            }
        };
        self.settle(BranchState::Merged);

        // Operations queued between the last pass and the state change.
        report.absorb(self.commit_pending().await?);
        {
            let mut state = self.state();
            for lost in &report.lost_exclusive {
                state.lost.remove(&lost.node);
            }
        }

        if let Err(err) = self.fast_forward_locked().await {
            warn!(client = %self.client, error = %err, "fast-forward after resolution failed");
        }

        info!(
            client = %self.client,
            committed = ?report.committed,
            attempts = report.attempts,
            conflicts = report.conflicts.len(),
            lost_exclusive = report.lost_exclusive.len(),
            "updates re-enabled"
        );
        Ok(report)
    }

    /// Leave `Resolving` for `to`, unless updates were disabled meanwhile.
    fn settle(&self, to: BranchState) {
        let mut state = self.state();
        if state.branch == BranchState::Resolving {
            state.branch = to;
        }
    }

    /// Fast-forward a `Merged` client to the sequencer head, committing any
    /// operations still queued first. Returns the head sequence number.
    /// A diverged client is left alone.
    pub async fn sync_from_server(&self) -> Result<u64, SyncError> {
        if self.branch_state() != BranchState::Merged {
            debug!(client = %self.client, "diverged, not syncing from server");
            return Ok(self.head_seq());
        }
        let _commit = self.commit_lock.lock().await;
        self.commit_pending().await?;
        self.fast_forward_locked().await
    }

    async fn fast_forward_locked(&self) -> Result<u64, SyncError> {
        let base = {
            let state = self.state();
            if state.branch != BranchState::Merged {
                return Ok(state.head.seq);
            }
            Arc::clone(&state.head)
        };
        let revisions = self.fetch_since(&base).await?;
        if let Some(latest) = revisions.last() {
            if self.state().branch == BranchState::Merged {
                self.install(latest, 0, &[]);
                debug!(client = %self.client, from = base.seq, to = latest.seq, "fast-forwarded");
            }
        }
        Ok(self.head_seq())
    }

    // -----------------------------------------------------------------------
    // Commit loop
    // -----------------------------------------------------------------------

    /// Resolve and commit queued operations until the log is empty or
    /// updates are disabled. The caller holds `commit_lock`.
    async fn commit_pending(&self) -> Result<ResolutionReport, SyncError> {
        let mut report = ResolutionReport::default();
        let mut rejected = 0u32;

        loop {
            let (base, ops, local) = {
                let state = self.state();
                if state.log.is_empty() || state.branch == BranchState::Unmerged {
                    break;
                }
                (
                    Arc::clone(&state.head),
                    state.log.snapshot(),
                    state.local.clone(),
                )
            };
            report.attempts += 1;

            let revisions = self.fetch_since(&base).await?;
            let merged_head = revisions
                .last()
                .cloned()
                .unwrap_or_else(|| Arc::clone(&base));

            let resolved = ConflictResolver::resolve(&ResolveInput {
                client: &self.client,
                base: &base.tree,
                merged_head: &merged_head,
                merged_revisions: &revisions,
                local: &local,
                unmerged: &ops,
            });
            for lost in &resolved.lost_exclusive {
                warn!(client = %self.client, path = %lost.path, "exclusive create lost");
            }

            if resolved.is_empty() {
                debug!(
                    client = %self.client,
                    seq = merged_head.seq,
                    consumed = ops.len(),
                    "nothing left to commit, adopting merged head"
                );
                self.install(&merged_head, ops.len(), &resolved.lost_exclusive);
                report.conflicts.extend(resolved.conflicts);
                report.lost_exclusive.extend(resolved.lost_exclusive);
                continue;
            }

            let candidate = TreeMerger::merge(&merged_head.tree, &resolved.ops)?;
            let draft = RevisionDraft {
                writer: self.client.clone(),
                tree: Arc::new(candidate),
                ops: resolved.ops,
            };

            match self
                .timed(SequencerOp::Put, self.sequencer.put(draft, merged_head.seq))
                .await?
            {
                PutOutcome::Accepted(revision) => {
                    info!(
                        client = %self.client,
                        seq = revision.seq,
                        ops = ops.len(),
                        conflicts = resolved.conflicts.len(),
                        "committed revision"
                    );
                    self.install(&revision, ops.len(), &resolved.lost_exclusive);
                    report.committed = Some(revision.seq);
                    report.conflicts.extend(resolved.conflicts);
                    report.lost_exclusive.extend(resolved.lost_exclusive);
                }
                PutOutcome::Conflict { head } => {
                    let race = SyncError::CommitRejected {
                        expected_parent: merged_head.seq,
                        head,
                    };
                    rejected += 1;
                    if rejected > self.config.resolver.max_commit_retries {
                        warn!(client = %self.client, attempts = rejected, "giving up on commit");
                        return Err(SyncError::RetryCapExceeded { attempts: rejected });
                    }
                    debug!(client = %self.client, attempt = rejected, error = %race, "retrying");
                    tokio::time::sleep(self.config.resolver.retry_backoff()).await;
                }
            }
        }

        Ok(report)
    }

    /// Everything committed after `base`, checked to descend from it.
    async fn fetch_since(&self, base: &Revision) -> Result<Vec<Arc<Revision>>, SyncError> {
        let revisions = match self
            .timed(
                SequencerOp::RevisionsSince,
                self.sequencer.revisions_since(base.seq),
            )
            .await
        {
            Ok(revisions) => revisions,
            Err(err @ SequencerError::Pruned { .. }) => {
                return Err(SyncError::FatalDivergence {
                    base: base.seq,
                    detail: err.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        let mut parent = base.seq;
        for revision in &revisions {
            if revision.parent != Some(parent) {
                return Err(SyncError::FatalDivergence {
                    base: base.seq,
                    detail: format!("r{} does not descend from r{}", revision.seq, parent),
                });
            }
            parent = revision.seq;
        }
        Ok(revisions)
    }

    /// Make `revision` the new head: drop the `consumed` operations it
    /// covers, record the exclusive creates it lost, and replay the rest on
    /// top of it.
    fn install(&self, revision: &Arc<Revision>, consumed: usize, lost: &[LostExclusive]) {
        let mut state = self.state();
        state.log.drain_front(consumed);
        for record in lost {
            state.lost.insert(record.node, record.clone());
        }
        let mut local = (*revision.tree).clone();
        for op in state.log.iter() {
            if let Err(err) = local.apply(op) {
                warn!(
                    client = %self.client,
                    op = %op,
                    error = %err,
                    "queued operation does not apply to new head"
                );
            }
        }
        state.local = local;
        state.head = Arc::clone(revision);
        self.paths.invalidate();
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Plan operations against the local tree, apply them, queue them, and
    /// commit them if the client is `Merged`.
    async fn mutate<F>(&self, plan: F) -> Result<ResolutionReport, SyncError>
    where
        F: FnOnce(&Tree, &PathResolver) -> Result<Vec<OpKind>, TreeError>,
    {
        let flush = {
            let mut state = self.state();
            let kinds = plan(&state.local, &self.paths)?;
            if kinds.is_empty() {
                return Ok(ResolutionReport::default());
            }
            let origin = state.head.seq;
            let ops: Vec<Operation> = kinds
                .into_iter()
                .map(|kind| Operation::new(kind, origin))
                .collect();

            let mut next = state.local.clone();
            for op in &ops {
                next.apply(op)?;
            }
            state.local = next;
            for op in ops {
                debug!(client = %self.client, op = %op, "recorded operation");
                state.log.append(op);
            }
            !state.branch.is_diverged()
        };

        if !flush {
            return Ok(ResolutionReport::default());
        }
        let _commit = self.commit_lock.lock().await;
        self.commit_pending().await
    }

    /// Create a directory, and any missing parents. An existing directory is
    /// returned as-is.
    pub async fn mkdir(&self, path: &str) -> Result<NodeId, SyncError> {
        let mut created = None;
        self.mutate(|tree, _| {
            let components = split_path(path)?;
            if components.is_empty() {
                return Err(TreeError::InvalidPath(path.to_string()));
            }
            let mut ops = Vec::new();
            created = Some(plan_dirs(tree, &components, &mut ops)?);
            Ok(ops)
        })
        .await?;
        created.ok_or_else(|| TreeError::InvalidPath(path.to_string()).into())
    }

    /// Create a regular file holding `data`, creating missing parents.
    pub async fn create_file(&self, path: &str, data: &[u8]) -> Result<NodeId, SyncError> {
        self.create(path, CreateKind::File, data).await
    }

    /// Create a symlink pointing at `target`, creating missing parents.
    pub async fn symlink(&self, path: &str, target: &str) -> Result<NodeId, SyncError> {
        self.create(
            path,
            CreateKind::Symlink {
                target: target.to_string(),
            },
            &[],
        )
        .await
    }

    async fn create(&self, path: &str, kind: CreateKind, data: &[u8]) -> Result<NodeId, SyncError> {
        let node = NodeId::new();
        self.mutate(|tree, _| {
            let (components, name) = parent_and_name(path)?;
            let mut ops = Vec::new();
            let parent = plan_dirs(tree, &components, &mut ops)?;
            if tree.child(parent, name).is_some() {
                return Err(TreeError::AlreadyExists(path.to_string()));
            }
            ops.push(OpKind::Create {
                parent,
                name: name.to_string(),
                node,
                kind,
            });
            if !data.is_empty() {
                ops.push(OpKind::Write {
                    node,
                    offset: 0,
                    data: data.to_vec(),
                });
            }
            Ok(ops)
        })
        .await?;
        Ok(node)
    }

    /// Create a regular file that must not exist yet, here or on the merged
    /// branch. Losing the name, now or when the create is committed, is
    /// reported as [`ConflictError::AlreadyExists`].
    pub async fn create_exclusive(&self, path: &str) -> Result<NodeId, SyncError> {
        let (parent, name, diverged) = {
            let state = self.state();
            let (parent, name) = self.paths.resolve_parent(&state.local, path)?;
            (parent, name.to_string(), state.branch.is_diverged())
        };
        let taken = || {
            SyncError::Conflict(ConflictError::AlreadyExists {
                path: split_path(path).map(|c| c.join("/")).unwrap_or_default(),
                name: name.clone(),
            })
        };

        if self.state().local.child(parent, &name).is_some() {
            return Err(taken());
        }
        if diverged {
            let head = self
                .timed(SequencerOp::Head, self.sequencer.head())
                .await?;
            if head.tree.child(parent, &name).is_some() {
                info!(client = %self.client, path, seq = head.seq, "exclusive create: name taken on merged branch");
                return Err(taken());
            }
        }

        let node = NodeId::new();
        self.mutate(|tree, _| {
            if tree.child(parent, &name).is_some() {
                return Err(TreeError::AlreadyExists(name.clone()));
            }
            Ok(vec![OpKind::ExclusiveCreate {
                parent,
                name: name.clone(),
                node,
            }])
        })
        .await?;

        // The pass that resolved this create may belong to another caller.
        let lost = self.state().lost.remove(&node);
        match lost {
            Some(lost) => Err(lost.to_error().into()),
            None => Ok(node),
        }
    }

    /// Write `data` at `offset`, creating the file (and parents) if missing.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), SyncError> {
        self.mutate(|tree, paths| {
            let mut ops = Vec::new();
            let node = match paths.resolve(tree, path) {
                Ok(node) => node,
                Err(TreeError::NotFound(_)) => {
                    let (components, name) = parent_and_name(path)?;
                    let parent = plan_dirs(tree, &components, &mut ops)?;
                    let node = NodeId::new();
                    ops.push(OpKind::Create {
                        parent,
                        name: name.to_string(),
                        node,
                        kind: CreateKind::File,
                    });
                    node
                }
                Err(err) => return Err(err),
            };
            ops.push(OpKind::Write {
                node,
                offset,
                data: data.to_vec(),
            });
            Ok(ops)
        })
        .await?;
        Ok(())
    }

    /// Resize a file, zero-filling when it grows.
    pub async fn truncate(&self, path: &str, size: u64) -> Result<(), SyncError> {
        self.mutate(|tree, paths| {
            let node = paths.resolve(tree, path)?;
            Ok(vec![OpKind::Truncate { node, size }])
        })
        .await?;
        Ok(())
    }

    pub async fn set_mtime(&self, path: &str, mtime: DateTime<Utc>) -> Result<(), SyncError> {
        self.set_attr(path, Attr::Mtime(mtime)).await
    }

    pub async fn set_executable(&self, path: &str, executable: bool) -> Result<(), SyncError> {
        self.set_attr(path, Attr::Executable(executable)).await
    }

    async fn set_attr(&self, path: &str, attr: Attr) -> Result<(), SyncError> {
        self.mutate(|tree, paths| {
            let node = paths.resolve(tree, path)?;
            Ok(vec![OpKind::SetAttr { node, attr }])
        })
        .await?;
        Ok(())
    }

    /// Remove a file or symlink.
    pub async fn remove_file(&self, path: &str) -> Result<(), SyncError> {
        self.mutate(|tree, paths| {
            let node = paths.resolve(tree, path)?;
            let (parent, name, is_dir) = located(tree, node, path)?;
            if is_dir {
                return Err(TreeError::IsADirectory(path.to_string()));
            }
            Ok(vec![OpKind::Remove { parent, name, node }])
        })
        .await?;
        Ok(())
    }

    /// Remove an empty directory.
    pub async fn remove_dir(&self, path: &str) -> Result<(), SyncError> {
        self.mutate(|tree, paths| {
            let node = paths.resolve(tree, path)?;
            let (parent, name, is_dir) = located(tree, node, path)?;
            if !is_dir {
                return Err(TreeError::NotADirectory(path.to_string()));
            }
            if !tree.children(node)?.is_empty() {
                return Err(TreeError::DirectoryNotEmpty(path.to_string()));
            }
            Ok(vec![OpKind::Remove { parent, name, node }])
        })
        .await?;
        Ok(())
    }

    /// Remove `path` and everything below it, deepest entries first.
    pub async fn remove_all(&self, path: &str) -> Result<(), SyncError> {
        self.mutate(|tree, paths| {
            let top = paths.resolve(tree, path)?;
            let mut doomed = tree.descendants(top);
            doomed.reverse();
            doomed.push(top);
            doomed
                .into_iter()
                .map(|node| -> Result<OpKind, TreeError> {
                    let (parent, name, _) = located(tree, node, path)?;
                    Ok(OpKind::Remove { parent, name, node })
                })
                .collect()
        })
        .await?;
        Ok(())
    }

    /// Move `src` to `dst`, replacing a file or empty directory at `dst`.
    pub async fn rename(&self, src: &str, dst: &str) -> Result<(), SyncError> {
        self.mutate(|tree, paths| {
            let node = paths.resolve(tree, src)?;
            let (src_parent, src_name, _) = located(tree, node, src)?;
            let (dst_parent, dst_name) = paths.resolve_parent(tree, dst)?;
            Ok(vec![OpKind::Rename {
                node,
                src_parent,
                src_name,
                dst_parent,
                dst_name: dst_name.to_string(),
            }])
        })
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Local reads (never touch the sequencer)
    // -----------------------------------------------------------------------

    pub fn lookup(&self, path: &str) -> Result<NodeId, SyncError> {
        Ok(self.paths.resolve(&self.state().local, path)?)
    }

    /// Canonical path of a node in the local tree.
    pub fn path_of(&self, node: NodeId) -> Option<String> {
        self.paths.path_of(&self.state().local, node)
    }

    pub fn stat(&self, path: &str) -> Result<Stat, SyncError> {
        let state = self.state();
        let node = self.paths.resolve(&state.local, path)?;
        Ok(state.local.stat(node)?)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, SyncError> {
        let state = self.state();
        let node = self.paths.resolve(&state.local, path)?;
        Ok(state.local.entries(node)?)
    }

    /// File content. A symlink is followed one level, relative to the
    /// directory holding it.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, SyncError> {
        let state = self.state();
        let tree = &state.local;
        let node = self.paths.resolve(tree, path)?;
        let node = match tree.get(node).map(|n| &n.kind) {
            Some(NodeKind::Symlink { target }) => {
                let dir = tree
                    .get(node)
                    .and_then(|n| n.parent)
                    .and_then(|p| self.paths.path_of(tree, p))
                    .unwrap_or_default();
                let resolved = if target.starts_with('/') {
                    target.clone()
                } else {
                    join(&dir, target)
                };
                self.paths.resolve(tree, &resolved)?
            }
            _ => node,
        };
        match tree.get(node).map(|n| &n.kind) {
            Some(NodeKind::File { data, .. }) => Ok(data.clone()),
            Some(NodeKind::Directory { .. }) => Err(TreeError::IsADirectory(path.to_string()).into()),
            Some(NodeKind::Symlink { .. }) => Err(TreeError::NotAFile(path.to_string()).into()),
            None => Err(TreeError::NotFound(path.to_string()).into()),
        }
    }

    /// Target of a symlink.
    pub fn read_link(&self, path: &str) -> Result<String, SyncError> {
        let state = self.state();
        let node = self.paths.resolve(&state.local, path)?;
        match state.local.get(node).map(|n| &n.kind) {
            Some(NodeKind::Symlink { target }) => Ok(target.clone()),
            _ => Err(TreeError::InvalidPath(format!("{} is not a symlink", path)).into()),
        }
    }
}

/// RAII guard for the single-flight resolving flag.
struct ResolveLockGuard(Arc<AtomicBool>);

impl Drop for ResolveLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run a sequencer call under a deadline.
async fn bounded<T, F>(limit: Duration, op: SequencerOp, fut: F) -> Result<T, SequencerError>
where
    F: Future<Output = Result<T, SequencerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            let timeout_ms = limit.as_millis() as u64;
            warn!(op = %op, timeout_ms, "sequencer call timed out");
            Err(SequencerError::Timeout { op, timeout_ms })
        }
    }
}

/// Resolve `components` from the root, planning creates for the missing
/// tail. Returns the identity of the last component.
fn plan_dirs(tree: &Tree, components: &[&str], ops: &mut Vec<OpKind>) -> Result<NodeId, TreeError> {
    let mut current = tree.root();
    let mut walked = String::new();
    let mut planning = false;
    for component in components {
        walked = join(&walked, component);
        if !planning {
            if let Some(child) = tree.child(current, component) {
                if !tree.get(child).is_some_and(|n| n.is_dir()) {
                    return Err(TreeError::NotADirectory(walked));
                }
                current = child;
                continue;
            }
            planning = true;
        }
        let node = NodeId::new();
        ops.push(OpKind::Create {
            parent: current,
            name: component.to_string(),
            node,
            kind: CreateKind::Directory,
        });
        current = node;
    }
    Ok(current)
}

/// `(parent, name, is_dir)` of a non-root node.
fn located(tree: &Tree, node: NodeId, path: &str) -> Result<(NodeId, String, bool), TreeError> {
    let n = tree
        .get(node)
        .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
    let parent = n
        .parent
        .ok_or_else(|| TreeError::InvalidPath(format!("'{}' names the root", path)))?;
    Ok((parent, n.name.clone(), n.is_dir()))
}
