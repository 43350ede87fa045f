/*
 * Maps an absolute path to the workspace root that owns it. With nested roots
 * the longest matching root wins. Matching is component-wise, so `/ws/app`
 * owns `/ws/app/src` but not `/ws/application`. Resolutions are memoized per
 * path until the root set changes.
 */
use crate::core::path_utils;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct WorkspaceRoots {
    roots: Vec<PathBuf>,
    resolved: RefCell<HashMap<PathBuf, Option<PathBuf>>>,
}

impl WorkspaceRoots {
    /*
     * Roots are kept in declaration order, which is also the order used when
     * listing roots and checked files. Duplicates are dropped.
     */
    pub fn new(roots: Vec<PathBuf>) -> Self {
        let mut unique: Vec<PathBuf> = Vec::with_capacity(roots.len());
        for root in roots {
            if !unique.contains(&root) {
                unique.push(root);
            }
        }
        WorkspaceRoots {
            roots: unique,
            resolved: RefCell::new(HashMap::new()),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn set_roots(&mut self, roots: Vec<PathBuf>) {
        *self = WorkspaceRoots::new(roots);
        log::debug!("WorkspaceRoots: Root set replaced ({} roots).", self.roots.len());
    }

    pub fn is_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|r| r == path)
    }

    // Position of `root` in declaration order; unknown roots sort last.
    pub fn root_index(&self, root: &Path) -> usize {
        self.roots
            .iter()
            .position(|r| r == root)
            .unwrap_or(self.roots.len())
    }

    pub fn resolve(&self, path: &Path) -> Option<PathBuf> {
        if let Some(cached) = self.resolved.borrow().get(path) {
            return cached.clone();
        }
        let owner = self
            .roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| path_utils::path_depth(root))
            .cloned();
        self.resolved
            .borrow_mut()
            .insert(path.to_path_buf(), owner.clone());
        owner
    }

    // Owning root plus the path relative to it.
    pub fn relative_to_root(&self, path: &Path) -> Option<(PathBuf, PathBuf)> {
        let root = self.resolve(path)?;
        let relative = path.strip_prefix(&root).ok()?.to_path_buf();
        Some((root, relative))
    }

    // Display form of a path relative to its root, always with '/' separators.
    pub fn display_path(&self, path: &Path) -> String {
        match self.relative_to_root(path) {
            Some((_, relative)) => relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            None => path.to_string_lossy().into_owned(),
        }
    }

    pub fn memo_len(&self) -> usize {
        self.resolved.borrow().len()
    }
}
