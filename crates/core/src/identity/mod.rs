//! Identity & path resolution.
//!
//! Nodes are addressed by [`NodeId`](crate::models::NodeId) everywhere inside
//! the engine; paths exist only at the adapter boundary. This module converts
//! between the two:
//! 1. `(parent identity, name) -> child identity` lookups straight off the tree
//! 2. `path -> identity` by walking components from the root
//! 3. `identity -> canonical path` through a cache invalidated whenever the
//!    tree's structure changes

pub mod path;
pub mod resolver;

pub use path::{join, parent_and_name, split_path};
pub use resolver::{canonical_path, PathResolver};
