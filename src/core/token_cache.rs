/*
 * Token accounting for the workspace tree.
 *
 * Three path-keyed caches are kept, each invalidated on its own:
 * - per-file counts, valid while the stored mtime equals the file's current
 *   mtime (staleness is detected lazily on the next read),
 * - full directory aggregates (sum over every non-excluded descendant file),
 * - selected directory aggregates (sum over the checked subset only).
 *
 * Selection changes only touch the selected aggregates; content changes touch
 * both kinds for every ancestor of the changed file.
 *
 * File counts are mirrored into one persisted document per workspace root. A
 * newly computed count marks its root dirty and arms a trailing 10 second
 * flush; the flush runs from `flush_if_due`, called by the session's tick.
 * After `dispose` nothing is written any more.
 *
 * Counting never fails: an unreadable file counts as 0 tokens.
 */
use crate::core::checksum_utils;
use crate::core::debounce::Debouncer;
use crate::core::durable_store::{
    self, BlobStoreOperations, PersistedTokenCache, PersistedTokenEntry,
};
use crate::core::envelope;
use crate::core::models::LineRange;
use crate::core::path_ownership::WorkspaceRoots;
use crate::core::path_utils;
use crate::core::selection_store::{SelectionChange, SelectionStore};
use crate::core::tokenizer_utils::TokenCounterOperations;
use crate::core::tree_context::{SymlinkGuard, TreeContext};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PERSIST_QUIET_PERIOD: Duration = Duration::from_secs(10);

// A cache hit only re-dirties the durable mirror when `last_used` is older than this.
const LAST_USED_REFRESH_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy)]
struct FileTokenEntry {
    modified_at: u64,
    token_count: usize,
}

pub struct TokenCache {
    counter: Box<dyn TokenCounterOperations>,
    store: Arc<dyn BlobStoreOperations>,
    file_entries: HashMap<PathBuf, FileTokenEntry>,
    dir_totals: HashMap<PathBuf, usize>,
    selected_totals: HashMap<PathBuf, usize>,
    line_ranges: HashMap<PathBuf, LineRange>,
    persisted: HashMap<PathBuf, PersistedTokenCache>,
    dirty_roots: HashSet<PathBuf>,
    persist_debouncer: Debouncer,
    disposed: bool,
}

impl TokenCache {
    pub fn new(counter: Box<dyn TokenCounterOperations>, store: Arc<dyn BlobStoreOperations>) -> Self {
        TokenCache {
            counter,
            store,
            file_entries: HashMap::new(),
            dir_totals: HashMap::new(),
            selected_totals: HashMap::new(),
            line_ranges: HashMap::new(),
            persisted: HashMap::new(),
            dirty_roots: HashSet::new(),
            persist_debouncer: Debouncer::new(PERSIST_QUIET_PERIOD),
            disposed: false,
        }
    }

    /*
     * Loads the persisted document of every root. Entries unused for more than
     * seven days are pruned on the way in. A missing, unreadable or corrupted
     * document is treated as empty, and so is one written by another estimator.
     */
    pub fn load_from_store(&mut self, roots: &[PathBuf]) {
        let now = durable_store::now_unix_seconds();
        let estimator = self.counter.estimator_id();
        for root in roots {
            let key = checksum_utils::token_cache_key_for_root(root);
            let empty = || PersistedTokenCache::new(root.clone(), estimator);
            let mut document = match self.store.load_blob(&key) {
                Ok(Some(blob)) => match PersistedTokenCache::decode(&blob) {
                    Ok(doc) if doc.root != *root => {
                        log::warn!(
                            "TokenCache: Stored cache for {root:?} belongs to {:?}; ignoring it.",
                            doc.root
                        );
                        empty()
                    }
                    Ok(doc) if doc.estimator != estimator => {
                        log::debug!(
                            "TokenCache: Stored cache for {root:?} was counted by {:?}, not {estimator:?}; ignoring it.",
                            doc.estimator
                        );
                        self.mark_dirty(root);
                        empty()
                    }
                    Ok(doc) => doc,
                    Err(e) => {
                        log::warn!("TokenCache: Discarding corrupted cache for {root:?}: {e}");
                        empty()
                    }
                },
                Ok(None) => empty(),
                Err(e) => {
                    log::warn!("TokenCache: Failed to read stored cache for {root:?}: {e}");
                    empty()
                }
            };

            let pruned = document.prune_inactive(now);
            if pruned > 0 {
                log::debug!("TokenCache: Pruned {pruned} inactive entries for {root:?}.");
                self.mark_dirty(root);
            }
            for (relative, entry) in &document.entries {
                self.file_entries.insert(
                    root.join(relative),
                    FileTokenEntry {
                        modified_at: entry.modified_at,
                        token_count: entry.token_count,
                    },
                );
            }
            log::debug!(
                "TokenCache: Loaded {} persisted entries for {root:?}.",
                document.entries.len()
            );
            self.persisted.insert(root.clone(), document);
        }
    }

    /*
     * Replaces the root set. Pending counts are flushed first, then every
     * in-memory cache is dropped and the documents of the new roots are loaded.
     */
    pub fn reload_roots(&mut self, roots: &[PathBuf]) {
        self.flush_now();
        self.file_entries.clear();
        self.dir_totals.clear();
        self.selected_totals.clear();
        self.persisted.clear();
        self.line_ranges.retain(|path, _| roots.iter().any(|r| path.starts_with(r)));
        self.load_from_store(roots);
    }

    pub fn file_tokens(&mut self, ctx: &TreeContext, path: &Path) -> usize {
        let Some(meta) = ctx.metadata(path) else {
            self.file_entries.remove(path);
            return 0;
        };
        if meta.is_dir {
            return 0;
        }

        let ranged = self.line_ranges.contains_key(path);
        if let Some(entry) = self.file_entries.get(path) {
            if entry.modified_at == meta.modified_at {
                let count = entry.token_count;
                if !ranged {
                    self.touch_persisted(ctx.roots, path);
                }
                return count;
            }
        }

        let content = match ctx.fs.read_text(path) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("TokenCache: Failed to read {path:?}, counting 0 tokens: {e}");
                self.file_entries.remove(path);
                return 0;
            }
        };
        let content = match self.line_ranges.get(path) {
            Some(range) => envelope::apply_line_range(&content, *range),
            None => content,
        };
        let wrapped = envelope::wrap_file_content(&ctx.roots.display_path(path), &content);
        let token_count = self.counter.count_tokens(&wrapped);
        log::trace!("TokenCache: Counted {token_count} tokens for {path:?}.");

        self.file_entries.insert(
            path.to_path_buf(),
            FileTokenEntry {
                modified_at: meta.modified_at,
                token_count,
            },
        );
        // Range annotations are not persisted, so neither are the counts they produce.
        if !ranged {
            self.record_persisted(ctx.roots, path, meta.modified_at, token_count);
        }
        token_count
    }

    pub fn directory_tokens(&mut self, ctx: &TreeContext, dir: &Path) -> usize {
        let mut guard = SymlinkGuard::new();
        self.directory_tokens_guarded(ctx, dir, &mut guard)
    }

    fn directory_tokens_guarded(&mut self, ctx: &TreeContext, dir: &Path, guard: &mut SymlinkGuard) -> usize {
        if let Some(total) = self.dir_totals.get(dir) {
            return *total;
        }
        if !guard.enter(ctx.fs, dir) {
            return 0;
        }
        let mut total = 0;
        for child in ctx.list_children(dir) {
            total += if child.is_directory {
                self.directory_tokens_guarded(ctx, &child.path, guard)
            } else {
                self.file_tokens(ctx, &child.path)
            };
        }
        guard.leave();
        self.dir_totals.insert(dir.to_path_buf(), total);
        total
    }

    /*
     * Sum over the checked subset of `dir`: a Checked child directory
     * contributes its full aggregate, a partial one recurses, a Checked file
     * contributes its count and anything else contributes nothing.
     */
    pub fn directory_selected_tokens(
        &mut self,
        ctx: &TreeContext,
        selection: &SelectionStore,
        dir: &Path,
    ) -> usize {
        let mut guard = SymlinkGuard::new();
        self.directory_selected_tokens_guarded(ctx, selection, dir, &mut guard)
    }

    fn directory_selected_tokens_guarded(
        &mut self,
        ctx: &TreeContext,
        selection: &SelectionStore,
        dir: &Path,
        guard: &mut SymlinkGuard,
    ) -> usize {
        if let Some(total) = self.selected_totals.get(dir) {
            return *total;
        }
        if !guard.enter(ctx.fs, dir) {
            return 0;
        }
        let mut total = 0;
        for child in ctx.list_children(dir) {
            let checked = selection.get_state(&child.path).is_checked();
            total += match (child.is_directory, checked) {
                (true, true) => self.directory_tokens(ctx, &child.path),
                (true, false) if selection.is_partial(&child.path) => {
                    self.directory_selected_tokens_guarded(ctx, selection, &child.path, guard)
                }
                (false, true) => self.file_tokens(ctx, &child.path),
                _ => 0,
            };
        }
        guard.leave();
        self.selected_totals.insert(dir.to_path_buf(), total);
        total
    }

    /*
     * Drops the entry of `path` (and of everything beneath it, for a deleted
     * directory) together with both aggregate kinds of every ancestor up to
     * the root. Nothing is recomputed until the next read.
     */
    pub fn invalidate_for_changed_file(&mut self, roots: &WorkspaceRoots, path: &Path) {
        self.file_entries.retain(|p, _| !p.starts_with(path));
        self.dir_totals.retain(|p, _| !p.starts_with(path));
        self.selected_totals.retain(|p, _| !p.starts_with(path));

        if let Some((root, relative)) = roots.relative_to_root(path) {
            let key = relative_key(&relative);
            if let Some(document) = self.persisted.get_mut(&root) {
                let before = document.entries.len();
                let prefix = format!("{key}/");
                document
                    .entries
                    .retain(|k, _| k != &key && !k.starts_with(&prefix));
                if document.entries.len() != before {
                    self.mark_dirty(&root);
                }
            }
            for ancestor in path_utils::ancestors_up_to_root(path, &root) {
                self.dir_totals.remove(&ancestor);
                self.selected_totals.remove(&ancestor);
            }
        }
        log::trace!("TokenCache: Invalidated {path:?} and its ancestors.");
    }

    // Drops the full aggregate of `dir` and of every ancestor up to the root.
    pub fn invalidate_directory(&mut self, roots: &WorkspaceRoots, dir: &Path) {
        self.dir_totals.remove(dir);
        if let Some(root) = roots.resolve(dir) {
            for ancestor in path_utils::ancestors_up_to_root(dir, &root) {
                self.dir_totals.remove(&ancestor);
            }
        }
    }

    pub fn invalidate_selected(&mut self, dir: &Path) {
        self.selected_totals.remove(dir);
    }

    pub fn invalidate_selected_subtree(&mut self, dir: &Path) {
        self.selected_totals.retain(|p, _| !p.starts_with(dir));
    }

    pub fn invalidate_all_selected(&mut self) {
        self.selected_totals.clear();
    }

    pub fn apply_selection_change(&mut self, change: &SelectionChange) {
        for subtree in &change.cascaded_subtrees {
            self.invalidate_selected_subtree(subtree);
        }
        for dir in &change.touched_directories {
            self.invalidate_selected(dir);
        }
    }

    /*
     * Full reset, used when exclusion rules, the estimator or a line range
     * change. The durable mirror is emptied and marked dirty so the next flush
     * rewrites it from recomputed values.
     */
    pub fn clear_caches(&mut self) {
        self.file_entries.clear();
        self.dir_totals.clear();
        self.selected_totals.clear();
        let roots: Vec<PathBuf> = self.persisted.keys().cloned().collect();
        for document in self.persisted.values_mut() {
            document.entries.clear();
        }
        for root in &roots {
            self.mark_dirty(root);
        }
        log::debug!("TokenCache: Cleared all caches.");
    }

    pub fn line_range(&self, path: &Path) -> Option<LineRange> {
        self.line_ranges.get(path).copied()
    }

    // Returns true if the annotation changed (and the caches were cleared).
    pub fn set_line_range(&mut self, path: &Path, range: Option<LineRange>) -> bool {
        let previous = match range {
            Some(r) => self.line_ranges.insert(path.to_path_buf(), r),
            None => self.line_ranges.remove(path),
        };
        if previous == range {
            return false;
        }
        self.clear_caches();
        true
    }

    pub fn set_token_counter(&mut self, counter: Box<dyn TokenCounterOperations>) {
        self.counter = counter;
        let estimator = self.counter.estimator_id();
        for document in self.persisted.values_mut() {
            document.estimator = estimator.to_string();
        }
        self.clear_caches();
    }

    pub fn is_flush_pending(&self) -> bool {
        self.persist_debouncer.is_pending()
    }

    pub fn flush_if_due(&mut self, now: Instant) -> bool {
        if self.disposed || !self.persist_debouncer.fire_if_due(now) {
            return false;
        }
        self.flush_now();
        true
    }

    /*
     * Writes every dirty root document. A failed write is logged and the root
     * stays dirty for the next flush.
     */
    pub fn flush_now(&mut self) {
        self.persist_debouncer.cancel();
        if self.disposed {
            return;
        }
        let dirty: Vec<PathBuf> = self.dirty_roots.drain().collect();
        for root in dirty {
            let Some(document) = self.persisted.get(&root) else {
                continue;
            };
            let key = checksum_utils::token_cache_key_for_root(&root);
            let result = document
                .encode()
                .and_then(|blob| self.store.save_blob(&key, &blob));
            match result {
                Ok(()) => log::debug!(
                    "TokenCache: Persisted {} entries for {root:?}.",
                    document.entries.len()
                ),
                Err(e) => {
                    log::warn!("TokenCache: Failed to persist cache for {root:?}: {e}");
                    self.dirty_roots.insert(root);
                }
            }
        }
    }

    pub fn dispose(&mut self) {
        self.persist_debouncer.cancel();
        self.disposed = true;
        log::debug!("TokenCache: Disposed; durable writes are disabled.");
    }

    fn mark_dirty(&mut self, root: &Path) {
        if self.disposed {
            return;
        }
        self.dirty_roots.insert(root.to_path_buf());
        self.persist_debouncer.schedule_if_idle(Instant::now());
    }

    fn record_persisted(&mut self, roots: &WorkspaceRoots, path: &Path, modified_at: u64, token_count: usize) {
        let Some((root, relative)) = roots.relative_to_root(path) else {
            return;
        };
        let estimator = self.counter.estimator_id();
        let document = self
            .persisted
            .entry(root.clone())
            .or_insert_with(|| PersistedTokenCache::new(root.clone(), estimator));
        document.entries.insert(
            relative_key(&relative),
            PersistedTokenEntry {
                modified_at,
                token_count,
                last_used: durable_store::now_unix_seconds(),
            },
        );
        self.mark_dirty(&root);
    }

    fn touch_persisted(&mut self, roots: &WorkspaceRoots, path: &Path) {
        let Some((root, relative)) = roots.relative_to_root(path) else {
            return;
        };
        let now = durable_store::now_unix_seconds();
        let stale = match self
            .persisted
            .get_mut(&root)
            .and_then(|doc| doc.entries.get_mut(&relative_key(&relative)))
        {
            Some(entry) if now - entry.last_used > LAST_USED_REFRESH_SECS => {
                entry.last_used = now;
                true
            }
            _ => false,
        };
        if stale {
            self.mark_dirty(&root);
        }
    }
}

fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WorkspaceSettings;
    use crate::core::durable_store::{PRUNE_AFTER_SECS, StoreError};
    use crate::core::file_system::CoreFileSystem;
    use crate::core::pattern_matcher::PatternRegistry;
    use crate::core::tokenizer_utils::ByteRatioTokenEstimator;
    use std::fs;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    // Counts content lines, ignoring the envelope markers and blank lines.
    struct MockLineCounter {
        calls: Arc<AtomicUsize>,
        id: &'static str,
    }

    impl TokenCounterOperations for MockLineCounter {
        fn count_tokens(&self, text: &str) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            text.lines()
                .filter(|line| !line.is_empty() && !line.starts_with("--- "))
                .count()
        }

        fn estimator_id(&self) -> &'static str {
            self.id
        }
    }

    #[derive(Default)]
    struct MockBlobStore {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        saves: Mutex<Vec<String>>,
    }

    impl BlobStoreOperations for MockBlobStore {
        fn load_blob(&self, key: &str) -> durable_store::Result<Option<Vec<u8>>> {
            Ok(self.blobs.lock().unwrap().get(key).cloned())
        }

        fn save_blob(&self, key: &str, blob: &[u8]) -> durable_store::Result<()> {
            self.saves.lock().unwrap().push(key.to_string());
            self.blobs
                .lock()
                .unwrap()
                .insert(key.to_string(), blob.to_vec());
            Ok(())
        }
    }

    struct FailingBlobStore;

    impl BlobStoreOperations for FailingBlobStore {
        fn load_blob(&self, _key: &str) -> durable_store::Result<Option<Vec<u8>>> {
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }

        fn save_blob(&self, _key: &str, _blob: &[u8]) -> durable_store::Result<()> {
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }
    }

    fn lines(n: usize) -> String {
        "x\n".repeat(n)
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        fs: CoreFileSystem,
        roots: WorkspaceRoots,
        patterns: PatternRegistry,
        store: Arc<MockBlobStore>,
        calls: Arc<AtomicUsize>,
    }

    impl Fixture {
        /*
         * root/src/a.rs (10 lines), root/src/b.rs (20 lines),
         * root/src/deep/c.rs (5 lines), root/top.rs (1 line), root/skip.log
         */
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let root = dir.path().join("ws");
            fs::create_dir_all(root.join("src").join("deep")).unwrap();
            fs::write(root.join("src").join("a.rs"), lines(10)).unwrap();
            fs::write(root.join("src").join("b.rs"), lines(20)).unwrap();
            fs::write(root.join("src").join("deep").join("c.rs"), lines(5)).unwrap();
            fs::write(root.join("top.rs"), lines(1)).unwrap();
            fs::write(root.join("skip.log"), lines(100)).unwrap();
            let settings = WorkspaceSettings {
                ignore_patterns: vec!["*.log".to_string()],
                ..WorkspaceSettings::default()
            };
            let roots = WorkspaceRoots::new(vec![root.clone()]);
            let patterns = PatternRegistry::load(roots.roots(), &settings);
            Fixture {
                _dir: dir,
                root,
                fs: CoreFileSystem::new(),
                roots,
                patterns,
                store: Arc::new(MockBlobStore::default()),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn cache(&self) -> TokenCache {
            self.cache_with_estimator("mock-lines")
        }

        fn cache_with_estimator(&self, id: &'static str) -> TokenCache {
            TokenCache::new(
                Box::new(MockLineCounter {
                    calls: Arc::clone(&self.calls),
                    id,
                }),
                self.store.clone(),
            )
        }

        fn ctx(&self) -> TreeContext<'_> {
            TreeContext::new(&self.fs, &self.roots, &self.patterns)
        }

        fn p(&self, relative: &str) -> PathBuf {
            self.root.join(relative)
        }
    }

    // Moves the mtime forward so the change is visible even on coarse clocks.
    fn rewrite(path: &Path, content: &str) {
        fs::write(path, content).unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        let later = std::time::SystemTime::now() + Duration::from_secs(5);
        file.set_modified(later).unwrap();
    }

    #[test]
    fn test_file_tokens_are_memoized_by_mtime() {
        // Arrange
        let fx = Fixture::new();
        let mut cache = fx.cache();

        // Act
        let first = cache.file_tokens(&fx.ctx(), &fx.p("src/a.rs"));
        let second = cache.file_tokens(&fx.ctx(), &fx.p("src/a.rs"));

        // Assert
        assert_eq!(first, 10);
        assert_eq!(second, 10);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_modified_file_is_recounted_lazily() {
        let fx = Fixture::new();
        let mut cache = fx.cache();
        assert_eq!(cache.file_tokens(&fx.ctx(), &fx.p("src/a.rs")), 10);

        rewrite(&fx.p("src/a.rs"), &lines(3));

        assert_eq!(cache.file_tokens(&fx.ctx(), &fx.p("src/a.rs")), 3);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_directory_tokens_sum_non_excluded_descendants() {
        let fx = Fixture::new();
        let mut cache = fx.cache();

        assert_eq!(cache.directory_tokens(&fx.ctx(), &fx.p("src")), 35);
        assert_eq!(cache.directory_tokens(&fx.ctx(), &fx.root), 36);
    }

    #[test]
    fn test_invalidate_for_changed_file_recomputes_ancestors_on_next_read() {
        // Arrange
        let fx = Fixture::new();
        let mut cache = fx.cache();
        assert_eq!(cache.directory_tokens(&fx.ctx(), &fx.root), 36);

        // Act
        rewrite(&fx.p("src/deep/c.rs"), &lines(15));
        cache.invalidate_for_changed_file(&fx.roots, &fx.p("src/deep/c.rs"));

        // Assert
        assert_eq!(cache.directory_tokens(&fx.ctx(), &fx.p("src/deep")), 15);
        assert_eq!(cache.directory_tokens(&fx.ctx(), &fx.root), 46);
    }

    #[test]
    fn test_deleted_file_drops_out_of_aggregates() {
        let fx = Fixture::new();
        let mut cache = fx.cache();
        assert_eq!(cache.directory_tokens(&fx.ctx(), &fx.p("src")), 35);

        fs::remove_file(fx.p("src/b.rs")).unwrap();
        cache.invalidate_for_changed_file(&fx.roots, &fx.p("src/b.rs"));

        assert_eq!(cache.directory_tokens(&fx.ctx(), &fx.p("src")), 15);
        assert_eq!(cache.file_tokens(&fx.ctx(), &fx.p("src/b.rs")), 0);
    }

    #[test]
    fn test_selected_tokens_follow_selection_and_stay_below_full_count() {
        // Arrange
        let fx = Fixture::new();
        let mut cache = fx.cache();
        let mut selection = SelectionStore::new();
        let change = selection.set_checked(&fx.ctx(), &fx.p("src"), true, true);
        cache.apply_selection_change(&change);

        // Act & Assert: fully checked directory equals its full count.
        assert_eq!(cache.directory_selected_tokens(&fx.ctx(), &selection, &fx.p("src")), 35);
        assert_eq!(cache.directory_selected_tokens(&fx.ctx(), &selection, &fx.root), 35);

        let change = selection.set_checked(&fx.ctx(), &fx.p("src/deep/c.rs"), false, false);
        cache.apply_selection_change(&change);

        let selected = cache.directory_selected_tokens(&fx.ctx(), &selection, &fx.p("src"));
        let full = cache.directory_tokens(&fx.ctx(), &fx.p("src"));
        assert_eq!(selected, 30);
        assert!(selected < full);
        assert_eq!(cache.directory_selected_tokens(&fx.ctx(), &selection, &fx.root), 30);
    }

    #[test]
    fn test_selection_change_does_not_touch_full_aggregates() {
        let fx = Fixture::new();
        let mut cache = fx.cache();
        let mut selection = SelectionStore::new();
        cache.directory_tokens(&fx.ctx(), &fx.root);
        let calls_before = fx.calls.load(Ordering::SeqCst);

        let change = selection.set_checked(&fx.ctx(), &fx.p("top.rs"), true, false);
        cache.apply_selection_change(&change);

        assert_eq!(cache.directory_tokens(&fx.ctx(), &fx.root), 36);
        assert_eq!(cache.directory_selected_tokens(&fx.ctx(), &selection, &fx.root), 1);
        assert_eq!(fx.calls.load(Ordering::SeqCst), calls_before);
    }

    #[test]
    fn test_line_range_restricts_counted_lines_and_clears_caches() {
        let fx = Fixture::new();
        let mut cache = fx.cache();
        assert_eq!(cache.directory_tokens(&fx.ctx(), &fx.p("src")), 35);

        let changed = cache.set_line_range(&fx.p("src/b.rs"), Some(LineRange::new(1, 4)));
        let unchanged = cache.set_line_range(&fx.p("src/b.rs"), Some(LineRange::new(1, 4)));

        assert!(changed);
        assert!(!unchanged);
        assert_eq!(cache.file_tokens(&fx.ctx(), &fx.p("src/b.rs")), 4);
        assert_eq!(cache.directory_tokens(&fx.ctx(), &fx.p("src")), 19);
    }

    #[test]
    fn test_unreadable_file_counts_as_zero() {
        let fx = Fixture::new();
        let mut cache = fx.cache();
        assert_eq!(cache.file_tokens(&fx.ctx(), &fx.p("missing.rs")), 0);
    }

    #[test]
    fn test_flush_is_debounced_and_persisted_counts_are_reused() {
        // Arrange
        let fx = Fixture::new();
        let mut cache = fx.cache();
        let start = Instant::now();
        cache.file_tokens(&fx.ctx(), &fx.p("src/a.rs"));
        assert!(cache.is_flush_pending());

        // Act
        let early = cache.flush_if_due(start);
        let due = cache.flush_if_due(start + PERSIST_QUIET_PERIOD + Duration::from_secs(1));

        // Assert
        assert!(!early);
        assert!(due);
        assert!(!cache.is_flush_pending());
        assert_eq!(fx.store.saves.lock().unwrap().len(), 1);

        let mut reloaded = fx.cache();
        reloaded.load_from_store(fx.roots.roots());
        let calls_before = fx.calls.load(Ordering::SeqCst);
        assert_eq!(reloaded.file_tokens(&fx.ctx(), &fx.p("src/a.rs")), 10);
        assert_eq!(fx.calls.load(Ordering::SeqCst), calls_before);
    }

    #[test]
    fn test_ranged_counts_are_not_reused_by_the_next_session() {
        // Arrange
        let fx = Fixture::new();
        let mut first = fx.cache();
        first.load_from_store(fx.roots.roots());
        first.set_line_range(&fx.p("src/b.rs"), Some(LineRange::new(1, 2)));
        assert_eq!(first.file_tokens(&fx.ctx(), &fx.p("src/b.rs")), 2);
        assert_eq!(first.file_tokens(&fx.ctx(), &fx.p("src/a.rs")), 10);
        first.flush_now();
        first.dispose();

        // Act
        let mut second = fx.cache();
        second.load_from_store(fx.roots.roots());
        let calls_before = fx.calls.load(Ordering::SeqCst);

        // Assert
        assert_eq!(second.line_range(&fx.p("src/b.rs")), None);
        assert_eq!(second.file_tokens(&fx.ctx(), &fx.p("src/b.rs")), 20);
        assert_eq!(second.file_tokens(&fx.ctx(), &fx.p("src/a.rs")), 10);
        assert_eq!(fx.calls.load(Ordering::SeqCst), calls_before + 1, "only the ranged file is recounted");
    }

    #[test]
    fn test_cache_written_by_another_estimator_is_a_miss() {
        // Arrange
        let fx = Fixture::new();
        let mut first = fx.cache();
        first.load_from_store(fx.roots.roots());
        first.file_tokens(&fx.ctx(), &fx.p("src/a.rs"));
        first.flush_now();

        // Act
        let mut second = fx.cache_with_estimator("mock-lines-v2");
        second.load_from_store(fx.roots.roots());
        let calls_before = fx.calls.load(Ordering::SeqCst);
        let tokens = second.file_tokens(&fx.ctx(), &fx.p("src/a.rs"));
        second.flush_now();

        // Assert
        assert_eq!(tokens, 10);
        assert_eq!(fx.calls.load(Ordering::SeqCst), calls_before + 1);
        let key = checksum_utils::token_cache_key_for_root(&fx.root);
        let stored = PersistedTokenCache::decode(&fx.store.load_blob(&key).unwrap().unwrap()).unwrap();
        assert_eq!(stored.estimator, "mock-lines-v2");
        assert!(stored.entries.contains_key("src/a.rs"));
    }

    #[test]
    fn test_swapping_the_counter_retags_persisted_documents() {
        let fx = Fixture::new();
        let mut cache = fx.cache();
        cache.load_from_store(fx.roots.roots());

        cache.set_token_counter(Box::new(ByteRatioTokenEstimator::new()));
        cache.file_tokens(&fx.ctx(), &fx.p("top.rs"));
        cache.flush_now();

        let key = checksum_utils::token_cache_key_for_root(&fx.root);
        let stored = PersistedTokenCache::decode(&fx.store.load_blob(&key).unwrap().unwrap()).unwrap();
        assert_eq!(stored.estimator, crate::core::tokenizer_utils::BYTE_RATIO_ESTIMATOR_ID);
        assert_eq!(stored.entries.len(), 1);
    }

    #[test]
    fn test_load_prunes_entries_unused_for_seven_days() {
        // Arrange
        let fx = Fixture::new();
        let mut document = PersistedTokenCache::new(fx.root.clone(), "mock-lines");
        let now = durable_store::now_unix_seconds();
        let entry = |last_used| PersistedTokenEntry {
            modified_at: 1,
            token_count: 99,
            last_used,
        };
        document.entries.insert("old.rs".into(), entry(now - PRUNE_AFTER_SECS - 60));
        document.entries.insert("recent.rs".into(), entry(now));
        let key = checksum_utils::token_cache_key_for_root(&fx.root);
        fx.store.save_blob(&key, &document.encode().unwrap()).unwrap();

        // Act
        let mut cache = fx.cache();
        cache.load_from_store(fx.roots.roots());
        cache.flush_now();

        // Assert
        let blob = fx.store.load_blob(&key).unwrap().unwrap();
        let stored = PersistedTokenCache::decode(&blob).unwrap();
        assert!(stored.entries.contains_key("recent.rs"));
        assert!(!stored.entries.contains_key("old.rs"));
    }

    #[test]
    fn test_corrupted_store_is_a_cache_miss() {
        let fx = Fixture::new();
        let key = checksum_utils::token_cache_key_for_root(&fx.root);
        fx.store.save_blob(&key, b"{ not json").unwrap();
        let mut cache = fx.cache();

        cache.load_from_store(fx.roots.roots());

        assert_eq!(cache.file_tokens(&fx.ctx(), &fx.p("src/a.rs")), 10);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_store_never_breaks_counting() {
        let fx = Fixture::new();
        let mut cache = TokenCache::new(Box::new(ByteRatioTokenEstimator::new()), Arc::new(FailingBlobStore));

        cache.load_from_store(fx.roots.roots());
        let tokens = cache.file_tokens(&fx.ctx(), &fx.p("top.rs"));
        cache.flush_now();

        assert!(tokens > 0);
    }

    #[test]
    fn test_no_writes_after_dispose() {
        let fx = Fixture::new();
        let mut cache = fx.cache();
        cache.file_tokens(&fx.ctx(), &fx.p("src/a.rs"));

        cache.dispose();
        let flushed = cache.flush_if_due(Instant::now() + Duration::from_secs(60));
        cache.flush_now();

        assert!(!flushed);
        assert!(fx.store.saves.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clear_caches_marks_durable_mirror_dirty() {
        let fx = Fixture::new();
        let mut cache = fx.cache();
        cache.load_from_store(fx.roots.roots());
        cache.file_tokens(&fx.ctx(), &fx.p("src/a.rs"));
        cache.flush_now();
        let calls_before = fx.calls.load(Ordering::SeqCst);

        cache.clear_caches();
        cache.flush_now();

        assert_eq!(fx.store.saves.lock().unwrap().len(), 2);
        assert_eq!(cache.file_tokens(&fx.ctx(), &fx.p("src/a.rs")), 10);
        assert_eq!(fx.calls.load(Ordering::SeqCst), calls_before + 1);
    }
}
