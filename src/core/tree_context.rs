/*
 * `TreeContext` bundles the read-only collaborators every tree walk needs: the
 * filesystem, the root set and the per-root pattern matchers. It is built on
 * the fly from borrowed session fields, so the selection store and the token
 * cache can be mutated while the context is alive.
 */
use crate::core::file_system::{FileMetadata, FileSystemOperations};
use crate::core::models::Node;
use crate::core::path_ownership::WorkspaceRoots;
use crate::core::pattern_matcher::PatternRegistry;
use std::path::{Path, PathBuf};

pub struct TreeContext<'a> {
    pub fs: &'a dyn FileSystemOperations,
    pub roots: &'a WorkspaceRoots,
    pub patterns: &'a PatternRegistry,
}

impl<'a> TreeContext<'a> {
    pub fn new(
        fs: &'a dyn FileSystemOperations,
        roots: &'a WorkspaceRoots,
        patterns: &'a PatternRegistry,
    ) -> Self {
        TreeContext {
            fs,
            roots,
            patterns,
        }
    }

    // A path owned by no root is outside the workspace and treated as excluded.
    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        match self.roots.resolve(path) {
            Some(root) => self.patterns.is_excluded(&root, path, is_dir),
            None => true,
        }
    }

    /*
     * Non-excluded children of `dir`, directories first and in natural order.
     * A listing error is logged and yields an empty list.
     */
    pub fn list_children(&self, dir: &Path) -> Vec<Node> {
        match self.fs.list_directory(dir) {
            Ok(nodes) => nodes
                .into_iter()
                .filter(|node| !self.is_excluded(&node.path, node.is_directory))
                .collect(),
            Err(e) => {
                log::warn!("TreeContext: Failed to list {dir:?}: {e}");
                Vec::new()
            }
        }
    }

    pub fn metadata(&self, path: &Path) -> Option<FileMetadata> {
        match self.fs.metadata(path) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::trace!("TreeContext: No metadata for {path:?}: {e}");
                None
            }
        }
    }
}

/*
 * Tracks the canonical directories on the current recursion path. Entering a
 * directory whose canonical form is already on the path (a symlink pointing
 * back up the tree) is refused.
 */
#[derive(Debug, Default)]
pub struct SymlinkGuard {
    active: Vec<PathBuf>,
}

impl SymlinkGuard {
    pub fn new() -> Self {
        SymlinkGuard { active: Vec::new() }
    }

    pub fn enter(&mut self, fs: &dyn FileSystemOperations, dir: &Path) -> bool {
        let canonical = fs
            .canonicalize(dir)
            .unwrap_or_else(|_| dir.to_path_buf());
        if self.active.contains(&canonical) {
            log::debug!("SymlinkGuard: Skipping {dir:?}, it leads back to {canonical:?}.");
            return false;
        }
        self.active.push(canonical);
        true
    }

    pub fn leave(&mut self) {
        self.active.pop();
    }

    pub fn depth(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WorkspaceSettings;
    use crate::core::file_system::CoreFileSystem;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_list_children_filters_excluded_entries() {
        // Arrange
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("node_modules")).unwrap();
        fs::write(root.join("debug.log"), "x").unwrap();
        fs::write(root.join("main.rs"), "x").unwrap();
        let settings = WorkspaceSettings {
            ignore_patterns: vec!["*.log".to_string()],
            ..WorkspaceSettings::default()
        };
        let fs_ops = CoreFileSystem::new();
        let roots = WorkspaceRoots::new(vec![root.clone()]);
        let patterns = PatternRegistry::load(roots.roots(), &settings);
        let ctx = TreeContext::new(&fs_ops, &roots, &patterns);

        // Act
        let children = ctx.list_children(&root);

        // Assert
        let names: Vec<&str> = children.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["src", "main.rs"]);
        assert!(ctx.is_excluded(&root.join("debug.log"), false));
        assert!(ctx.is_excluded(Path::new("/not/in/workspace"), false));
    }

    #[test]
    fn test_list_children_of_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let fs_ops = CoreFileSystem::new();
        let roots = WorkspaceRoots::new(vec![dir.path().to_path_buf()]);
        let patterns = PatternRegistry::default();
        let ctx = TreeContext::new(&fs_ops, &roots, &patterns);

        assert!(ctx.list_children(&dir.path().join("gone")).is_empty());
        assert!(ctx.metadata(&dir.path().join("gone")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_guard_refuses_cycles() {
        // Arrange
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("a")).unwrap();
        std::os::unix::fs::symlink(&root, root.join("a").join("loop")).unwrap();
        let fs_ops = CoreFileSystem::new();
        let mut guard = SymlinkGuard::new();

        // Act & Assert
        assert!(guard.enter(&fs_ops, &root));
        assert!(guard.enter(&fs_ops, &root.join("a")));
        assert!(!guard.enter(&fs_ops, &root.join("a").join("loop")));
        guard.leave();
        assert_eq!(guard.depth(), 1);
    }
}
