/*
 * The tri-state selection over the workspace tree.
 *
 * Stored state is a flat map of path -> `CheckState::Checked`; an absent key
 * means Unchecked. Directories can additionally be flagged partial in a
 * disjoint set. After every mutation the invariant is restored bottom-up along
 * the ancestors of the changed path:
 *
 * - a directory is Checked iff every non-excluded child is Checked,
 * - it is partial iff some non-excluded child is Checked or partial but not all
 *   are Checked,
 * - otherwise it is Unchecked.
 *
 * Only children holding at least one non-excluded file count; an empty (or
 * fully excluded) sub-directory is neutral. A directory with no such children
 * keeps the state it was given by a toggle or a cascade until it is
 * recomputed, at which point it is Unchecked.
 * Excluded paths are never stored.
 *
 * Every mutation returns a `SelectionChange` naming the directories whose
 * selected-token aggregate became stale, so the caller can invalidate the
 * token cache within the same mutation.
 */
use crate::core::models::CheckState;
use crate::core::path_utils;
use crate::core::tree_context::{SymlinkGuard, TreeContext};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SelectionChange {
    // Directories whose own selected aggregate is stale.
    pub touched_directories: Vec<PathBuf>,
    // Sub-trees in which every selected aggregate is stale.
    pub cascaded_subtrees: Vec<PathBuf>,
}

impl SelectionChange {
    pub fn is_empty(&self) -> bool {
        self.touched_directories.is_empty() && self.cascaded_subtrees.is_empty()
    }

    pub fn merge(&mut self, other: SelectionChange) {
        self.touched_directories.extend(other.touched_directories);
        self.cascaded_subtrees.extend(other.cascaded_subtrees);
    }
}

#[derive(Debug, Default)]
pub struct SelectionStore {
    states: HashMap<PathBuf, CheckState>,
    partial: HashSet<PathBuf>,
}

impl SelectionStore {
    pub fn new() -> Self {
        SelectionStore::default()
    }

    pub fn get_state(&self, path: &Path) -> CheckState {
        self.states.get(path).copied().unwrap_or_default()
    }

    pub fn is_partial(&self, path: &Path) -> bool {
        self.partial.contains(path)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty() && self.partial.is_empty()
    }

    // True if `path` or anything beneath it carries stored state.
    pub fn has_state_under(&self, path: &Path) -> bool {
        self.states.keys().any(|p| p.starts_with(path))
            || self.partial.iter().any(|p| p.starts_with(path))
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.partial.clear();
    }

    // Raw Checked keys, directories included, in natural path order.
    pub fn checked_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .states
            .iter()
            .filter(|(_, state)| state.is_checked())
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort_by(|a, b| path_utils::compare_paths_naturally(a, b));
        paths
    }

    /*
     * Checks or unchecks a single path. For a directory the new state is
     * cascaded onto every non-excluded descendant (excluded sub-trees are
     * skipped); afterwards every ancestor up to the root is recomputed.
     * Excluded paths and paths outside the workspace are ignored.
     */
    pub fn set_checked(
        &mut self,
        ctx: &TreeContext,
        path: &Path,
        checked: bool,
        is_directory: bool,
    ) -> SelectionChange {
        let Some(root) = ctx.roots.resolve(path) else {
            log::debug!("SelectionStore: Ignoring {path:?}, it belongs to no workspace root.");
            return SelectionChange::default();
        };
        if ctx.is_excluded(path, is_directory) {
            log::debug!("SelectionStore: Ignoring excluded path {path:?}.");
            return SelectionChange::default();
        }

        let mut change = SelectionChange::default();
        if is_directory {
            if checked {
                let mut guard = SymlinkGuard::new();
                self.cascade_check(ctx, path, &mut guard);
            } else {
                self.remove_subtree(path);
            }
            change.cascaded_subtrees.push(path.to_path_buf());
        } else {
            self.store_state(path, CheckState::from_checked(checked));
        }

        change.merge(self.recompute_ancestors(ctx, path, &root));
        log::trace!(
            "SelectionStore: {} {path:?} ({} ancestors recomputed).",
            if checked { "Checked" } else { "Unchecked" },
            change.touched_directories.len()
        );
        change
    }

    /*
     * Replaces the whole selection with `paths`. Directories are applied first
     * (cascading), then files, then each affected ancestor is recomputed once,
     * deepest first. Paths that no longer exist, belong to no root or are now
     * excluded are dropped silently.
     */
    pub fn set_checked_paths(&mut self, ctx: &TreeContext, paths: &[PathBuf]) -> SelectionChange {
        self.clear();

        let mut directories = Vec::new();
        let mut files = Vec::new();
        for path in paths {
            let Some(meta) = ctx.metadata(path) else {
                log::trace!("SelectionStore: Dropping vanished path {path:?}.");
                continue;
            };
            if ctx.roots.resolve(path).is_none() || ctx.is_excluded(path, meta.is_dir) {
                log::trace!("SelectionStore: Dropping path {path:?}, it is outside the workspace or excluded.");
                continue;
            }
            if meta.is_dir {
                directories.push(path.clone());
            } else {
                files.push(path.clone());
            }
        }

        for dir in &directories {
            let mut guard = SymlinkGuard::new();
            self.cascade_check(ctx, dir, &mut guard);
        }
        for file in &files {
            self.store_state(file, CheckState::Checked);
        }

        let applied: Vec<PathBuf> = directories.into_iter().chain(files).collect();
        let mut change = self.recompute_ancestors_of_all(ctx, &applied);
        change
            .cascaded_subtrees
            .extend(ctx.roots.roots().iter().cloned());
        log::debug!(
            "SelectionStore: Restored selection from {} path(s), {} applied.",
            paths.len(),
            applied.len()
        );
        change
    }

    /*
     * Checked regular files (or symlinks to files) that still exist and are not
     * excluded. Directories are never returned. Ordered by root declaration
     * order, then natural path order within the root.
     */
    pub fn get_checked_files(&self, ctx: &TreeContext) -> Vec<PathBuf> {
        let mut files: Vec<(usize, PathBuf, PathBuf)> = self
            .states
            .iter()
            .filter(|(_, state)| state.is_checked())
            .filter_map(|(path, _)| {
                let meta = ctx.metadata(path)?;
                if meta.is_dir || ctx.is_excluded(path, false) {
                    return None;
                }
                let (root, relative) = ctx.roots.relative_to_root(path)?;
                Some((ctx.roots.root_index(&root), relative, path.clone()))
            })
            .collect();
        files.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| path_utils::compare_paths_naturally(&a.1, &b.1))
        });
        files.into_iter().map(|(_, _, path)| path).collect()
    }

    /*
     * Drops the state of a vanished path and of everything stored beneath it,
     * then recomputes the ancestors.
     */
    pub fn remove_path(&mut self, ctx: &TreeContext, path: &Path) -> SelectionChange {
        self.remove_subtree(path);
        let mut change = SelectionChange {
            touched_directories: Vec::new(),
            cascaded_subtrees: vec![path.to_path_buf()],
        };
        if let Some(root) = ctx.roots.resolve(path) {
            change.merge(self.recompute_ancestors(ctx, path, &root));
        }
        change
    }

    /*
     * Restores the invariant for the ancestors of `path` without changing the
     * path's own state. Used when a new unchecked entry appears under a
     * Checked directory.
     */
    pub fn refresh_ancestors(&mut self, ctx: &TreeContext, path: &Path) -> SelectionChange {
        match ctx.roots.resolve(path) {
            Some(root) => self.recompute_ancestors(ctx, path, &root),
            None => SelectionChange::default(),
        }
    }

    /*
     * Called after the exclusion rules changed. Unchecks every stored path that
     * vanished or is now excluded, then recomputes every stored directory and
     * all ancestors of stored or dropped paths, deepest first.
     */
    pub fn uncheck_excluded(&mut self, ctx: &TreeContext) -> SelectionChange {
        let stored: Vec<PathBuf> = self
            .states
            .keys()
            .chain(self.partial.iter())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut dropped = Vec::new();
        let mut directories = Vec::new();
        for path in &stored {
            match ctx.metadata(path) {
                Some(meta) if !ctx.is_excluded(path, meta.is_dir) => {
                    if meta.is_dir {
                        directories.push(path.clone());
                    }
                }
                _ => dropped.push(path.clone()),
            }
        }
        for path in &dropped {
            self.remove_subtree(path);
        }
        directories.retain(|d| !dropped.iter().any(|p| d.starts_with(p)));

        let mut targets: HashSet<PathBuf> = directories.into_iter().collect();
        for path in &stored {
            if let Some(root) = ctx.roots.resolve(path) {
                targets.extend(path_utils::ancestors_up_to_root(path, &root));
            }
        }
        let change = self.recompute_deepest_first(ctx, targets, dropped.clone());
        if !dropped.is_empty() {
            log::debug!(
                "SelectionStore: Unchecked {} path(s) that are now excluded or gone.",
                dropped.len()
            );
        }
        change
    }

    fn store_state(&mut self, path: &Path, state: CheckState) {
        match state {
            CheckState::Checked => {
                self.states.insert(path.to_path_buf(), CheckState::Checked);
            }
            CheckState::Unchecked => {
                self.states.remove(path);
            }
        }
        self.partial.remove(path);
    }

    fn remove_subtree(&mut self, path: &Path) {
        self.states.retain(|p, _| !p.starts_with(path));
        self.partial.retain(|p| !p.starts_with(path));
    }

    fn cascade_check(&mut self, ctx: &TreeContext, dir: &Path, guard: &mut SymlinkGuard) {
        self.store_state(dir, CheckState::Checked);
        if !guard.enter(ctx.fs, dir) {
            return;
        }
        for child in ctx.list_children(dir) {
            if child.is_directory {
                self.cascade_check(ctx, &child.path, guard);
            } else {
                self.store_state(&child.path, CheckState::Checked);
            }
        }
        guard.leave();
    }

    fn recompute_ancestors(&mut self, ctx: &TreeContext, path: &Path, root: &Path) -> SelectionChange {
        let ancestors = path_utils::ancestors_up_to_root(path, root);
        for ancestor in &ancestors {
            self.recompute_directory(ctx, ancestor);
        }
        SelectionChange {
            touched_directories: ancestors,
            cascaded_subtrees: Vec::new(),
        }
    }

    fn recompute_ancestors_of_all(&mut self, ctx: &TreeContext, paths: &[PathBuf]) -> SelectionChange {
        let mut targets = HashSet::new();
        for path in paths {
            if let Some(root) = ctx.roots.resolve(path) {
                targets.extend(path_utils::ancestors_up_to_root(path, &root));
            }
        }
        self.recompute_deepest_first(ctx, targets, Vec::new())
    }

    fn recompute_deepest_first(
        &mut self,
        ctx: &TreeContext,
        targets: HashSet<PathBuf>,
        cascaded_subtrees: Vec<PathBuf>,
    ) -> SelectionChange {
        let mut ordered: Vec<PathBuf> = targets.into_iter().collect();
        ordered.sort_by(|a, b| {
            path_utils::path_depth(b)
                .cmp(&path_utils::path_depth(a))
                .then_with(|| a.cmp(b))
        });
        for dir in &ordered {
            self.recompute_directory(ctx, dir);
        }
        SelectionChange {
            touched_directories: ordered,
            cascaded_subtrees,
        }
    }

    /*
     * Child directories without any non-excluded file beneath them hold no
     * selectable content and take no part in the parent's state.
     */
    fn recompute_directory(&mut self, ctx: &TreeContext, dir: &Path) {
        if ctx.is_excluded(dir, true) {
            self.store_state(dir, CheckState::Unchecked);
            return;
        }
        let children: Vec<_> = ctx
            .list_children(dir)
            .into_iter()
            .filter(|c| !c.is_directory || contains_files(ctx, &c.path, &mut SymlinkGuard::new()))
            .collect();
        let all_checked =
            !children.is_empty() && children.iter().all(|c| self.get_state(&c.path).is_checked());
        let any_selected = children
            .iter()
            .any(|c| self.get_state(&c.path).is_checked() || self.is_partial(&c.path));

        if all_checked {
            self.store_state(dir, CheckState::Checked);
        } else {
            self.store_state(dir, CheckState::Unchecked);
            if any_selected {
                self.partial.insert(dir.to_path_buf());
            }
        }
    }
}

// True if a non-excluded file exists anywhere beneath `dir`.
fn contains_files(ctx: &TreeContext, dir: &Path, guard: &mut SymlinkGuard) -> bool {
    if !guard.enter(ctx.fs, dir) {
        return false;
    }
    let children = ctx.list_children(dir);
    let found = children.iter().any(|c| !c.is_directory)
        || children
            .iter()
            .any(|c| c.is_directory && contains_files(ctx, &c.path, guard));
    guard.leave();
    found
}
