//! Conflict detection, resolution, and tree merging.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- summarising the merged branch and classifying each
//!    unmerged operation against it.
//! 2. **Resolution** -- replaying the unmerged branch onto the merged head and
//!    producing a rewritten operation sequence.
//! 3. **Merging** -- applying that sequence to the merged head to build the
//!    candidate revision.

pub mod detector;
pub mod merger;
pub mod resolver;

pub use detector::{Conflict, ConflictDetector, ConflictType, Resolution};
pub use merger::TreeMerger;
pub use resolver::{ConflictResolver, LostExclusive, ResolveInput, Resolved};
