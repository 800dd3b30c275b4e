//! Error types for the treesync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! The taxonomy maps onto how a caller has to react:
//! - [`ConflictError`] is user visible and surfaced verbatim (a lost
//!   exclusive create).
//! - [`SyncError::CommitRejected`] is a recoverable race, retried internally
//!   and only seen once the retry cap is exceeded.
//! - [`SyncError::FatalDivergence`] means the session must restart from a
//!   fresh checkout.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// Whether this error must be shown to the user as-is.
    pub fn is_user_visible(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Sync(SyncError::Conflict(_)) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tree errors
// ---------------------------------------------------------------------------

/// Errors from applying operations to, or looking up paths in, a tree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TreeError {
    /// No entry at the given path or identity.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// A path component that must be a directory is not one.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A file operation targeted a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// A content operation targeted something that is not a regular file.
    #[error("not a regular file: {0}")]
    NotAFile(String),

    /// The name is already taken in the target directory.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A directory removal found remaining entries.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// The path or entry name is malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A write or truncate would grow a file past [`crate::tree::MAX_FILE_SIZE`].
    #[error("file too large: {0}")]
    FileTooLarge(String),

    /// Moving a directory below itself.
    #[error("cannot move {0} into its own subtree")]
    WouldCycle(String),

    /// A structural invariant of the arena was violated.
    #[error("tree invariant violated: {0}")]
    Corrupt(String),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Conflicts that resolution cannot hide from the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConflictError {
    /// An exclusive create lost the race for its name.
    #[error("{name} already exists")]
    AlreadyExists {
        /// Path of the entry that could not be created.
        path: String,
        /// Final path component.
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Sequencer errors
// ---------------------------------------------------------------------------

/// Named sequencer calls, used for timeouts and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequencerOp {
    Put,
    RevisionsSince,
    Head,
}

impl std::fmt::Display for SequencerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Put => write!(f, "put"),
            Self::RevisionsSince => write!(f, "revisions_since"),
            Self::Head => write!(f, "head"),
        }
    }
}

/// Errors reported by (or on the way to) the metadata sequencer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SequencerError {
    /// The call did not complete within the configured bound.
    #[error("sequencer {op} timed out after {timeout_ms}ms")]
    Timeout { op: SequencerOp, timeout_ms: u64 },

    /// The caller may not read or write this tree.
    #[error("permission denied by sequencer: {0}")]
    PermissionDenied(String),

    /// History before the requested revision is no longer available.
    #[error("revision history before {available_from} was pruned (requested {seq})")]
    Pruned { seq: u64, available_from: u64 },

    /// A fault injected through the test/control surface.
    #[error("injected fault on sequencer {op}: {detail}")]
    Injected { op: SequencerOp, detail: String },

    /// The sequencer could not be reached.
    #[error("sequencer unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors from the per-client sync engine and its commit loop.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A resolution cycle is already in flight for this client.
    #[error("conflict resolution already in progress for client {client}")]
    AlreadyRunning { client: String },

    /// A branch state-machine transition was invalid.
    #[error("invalid branch state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The sequencer rejected a commit because another client won the race.
    #[error("commit on parent {expected_parent} rejected; sequencer head is {head}")]
    CommitRejected { expected_parent: u64, head: u64 },

    /// Commit races kept being lost.
    #[error("gave up after {attempts} rejected commit attempts")]
    RetryCapExceeded { attempts: u32 },

    /// The divergence point is no longer reachable from the merged head.
    #[error("divergence point r{base} is unreachable: {detail}")]
    FatalDivergence { base: u64, detail: String },

    /// A user-visible conflict.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// A local tree operation failed.
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    /// A sequencer call failed.
    #[error("sequencer error: {0}")]
    Sequencer(#[from] SequencerError),
}

impl SyncError {
    /// Races the commit loop retries on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CommitRejected { .. })
    }

    /// Errors that end the session; the caller has to check out afresh.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalDivergence { .. })
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
