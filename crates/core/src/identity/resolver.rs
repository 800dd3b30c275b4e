//! Path <-> identity resolution with a generation-checked reverse cache.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use super::path::{join, parent_and_name, split_path};
use crate::errors::TreeError;
use crate::models::NodeId;
use crate::tree::Tree;

/// Cached `identity -> path` results for one tree generation.
#[derive(Debug, Default)]
struct PathCache {
    generation: u64,
    paths: HashMap<NodeId, String>,
}

/// Resolves paths against a tree and caches canonical paths per identity.
///
/// Thread-safe: the cache sits behind an `RwLock`, so readers never block
/// each other. Cached entries are dropped as soon as a lookup is made against
/// a tree whose structure generation differs from the cached one, so a
/// rename is never answered with the old path.
#[derive(Debug, Default)]
pub struct PathResolver {
    cache: RwLock<PathCache>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(parent, name) -> child`.
    pub fn lookup(&self, tree: &Tree, parent: NodeId, name: &str) -> Option<NodeId> {
        tree.child(parent, name)
    }

    /// Walk `path` from the root.
    pub fn resolve(&self, tree: &Tree, path: &str) -> Result<NodeId, TreeError> {
        let mut current = tree.root();
        let mut walked = String::new();
        for component in split_path(path)? {
            let node = tree
                .get(current)
                .ok_or_else(|| TreeError::NotFound(walked.clone()))?;
            if !node.is_dir() {
                return Err(TreeError::NotADirectory(walked));
            }
            walked = join(&walked, component);
            current = tree
                .child(current, component)
                .ok_or_else(|| TreeError::NotFound(walked.clone()))?;
        }
        Ok(current)
    }

    /// Resolve the parent directory of `path`, returning it with the final
    /// component.
    pub fn resolve_parent<'p>(
        &self,
        tree: &Tree,
        path: &'p str,
    ) -> Result<(NodeId, &'p str), TreeError> {
        let (components, name) = parent_and_name(path)?;
        let parent = self.resolve(tree, &components.join("/"))?;
        match tree.get(parent) {
            Some(node) if node.is_dir() => Ok((parent, name)),
            _ => Err(TreeError::NotADirectory(components.join("/"))),
        }
    }

    /// Canonical path of `id`, or `None` if it is not in `tree`.
    pub fn path_of(&self, tree: &Tree, id: NodeId) -> Option<String> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if cache.generation == tree.generation() {
                if let Some(path) = cache.paths.get(&id) {
                    return Some(path.clone());
                }
            }
        }

        let path = canonical_path(tree, id)?;

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if cache.generation != tree.generation() {
            debug!(
                from = cache.generation,
                to = tree.generation(),
                "path cache invalidated"
            );
            cache.generation = tree.generation();
            cache.paths.clear();
        }
        cache.paths.insert(id, path.clone());
        Some(path)
    }

    /// Drop all cached paths.
    pub fn invalidate(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.paths.clear();
        cache.generation = 0;
    }

    /// Number of cached paths (diagnostics).
    pub fn cached(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .paths
            .len()
    }
}

/// Walk parent back-references from `id` up to the root. Uncached.
pub fn canonical_path(tree: &Tree, id: NodeId) -> Option<String> {
    let mut names = Vec::new();
    let mut cursor = tree.get(id)?;
    while let Some(parent) = cursor.parent {
        names.push(cursor.name.as_str());
        cursor = tree.get(parent)?;
    }
    names.reverse();
    Some(names.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{CreateKind, OpKind, Operation};

    fn mkdir(tree: &mut Tree, parent: NodeId, name: &str) -> NodeId {
        let node = NodeId::new();
        tree.apply(&Operation::new(
            OpKind::Create {
                parent,
                name: name.into(),
                node,
                kind: CreateKind::Directory,
            },
            0,
        ))
        .unwrap();
        node
    }

    #[test]
    fn test_resolve_and_reverse() {
        let mut tree = Tree::empty();
        let root = tree.root();
        let a = mkdir(&mut tree, root, "a");
        let b = mkdir(&mut tree, a, "b");
        let resolver = PathResolver::new();

        assert_eq!(resolver.resolve(&tree, "/a/b").unwrap(), b);
        assert_eq!(resolver.resolve(&tree, "").unwrap(), root);
        assert_eq!(resolver.path_of(&tree, b).as_deref(), Some("a/b"));
        assert_eq!(resolver.path_of(&tree, root).as_deref(), Some(""));
        assert_eq!(resolver.lookup(&tree, a, "b"), Some(b));
        assert!(matches!(
            resolver.resolve(&tree, "a/x"),
            Err(TreeError::NotFound(p)) if p == "a/x"
        ));
    }

    #[test]
    fn test_rename_invalidates_cached_path() {
        let mut tree = Tree::empty();
        let root = tree.root();
        let a = mkdir(&mut tree, root, "a");
        let b = mkdir(&mut tree, a, "b");
        let resolver = PathResolver::new();
        assert_eq!(resolver.path_of(&tree, b).as_deref(), Some("a/b"));
        assert_eq!(resolver.cached(), 1);

        tree.apply(&Operation::new(
            OpKind::Rename {
                node: b,
                src_parent: a,
                src_name: "b".into(),
                dst_parent: root,
                dst_name: "c".into(),
            },
            0,
        ))
        .unwrap();
        assert_eq!(resolver.path_of(&tree, b).as_deref(), Some("c"));
        assert_eq!(resolver.cached(), 1);
    }

    #[test]
    fn test_resolve_parent() {
        let mut tree = Tree::empty();
        let root = tree.root();
        let a = mkdir(&mut tree, root, "a");
        let resolver = PathResolver::new();
        assert_eq!(resolver.resolve_parent(&tree, "a/new").unwrap(), (a, "new"));
        assert!(resolver.resolve_parent(&tree, "missing/new").is_err());
    }
}
