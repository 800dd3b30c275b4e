//! treesync core library.
//!
//! This crate provides the conflict-resolution engine for a directory tree
//! shared by many devices: the tree model and its operations, the per-client
//! operation log and branch state machine, the conflict resolver and tree
//! merger, identity and path resolution, the sequencer interface, and the
//! sync engine tying them together.

pub mod branch;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod identity;
pub mod logging;
pub mod models;
pub mod ops;
pub mod sequencer;
pub mod sync_engine;
pub mod tree;

// Re-exports for convenience.
pub use branch::{BranchState, OperationLog};
pub use config::SyncConfig;
pub use errors::{ConflictError, CoreError, SequencerError, SyncError, TreeError};
pub use identity::PathResolver;
pub use models::{ClientId, EntryType, NodeId, Revision};
pub use sequencer::{MemorySequencer, Sequencer};
pub use sync_engine::{ResolutionReport, SyncEngine};
pub use tree::Tree;
