/*
 * `WorkspaceSession` owns every cache of one workspace session and is the only
 * entry point for the UI and for filesystem events.
 *
 * All mutations run on the thread that owns the session. Watcher callbacks
 * push `WorkspaceEvent`s into a single `mpsc` queue (see `event_sender`) which
 * is drained, in order, by `process_pending_events`. UI operations drain the
 * queue first, so UI and watcher mutations are totally ordered.
 *
 * Refreshes after filesystem activity are debounced: every event pushes the
 * refresh deadline one quiet period into the future, and `tick` fires the
 * refresh once the deadline passes. Ignore-file and settings changes refresh
 * immediately.
 */
use crate::core::checksum_utils;
use crate::core::config::{ClearBehavior, WorkspaceSettings};
use crate::core::debounce::Debouncer;
use crate::core::durable_store::{BlobStoreOperations, PersistedSelection};
use crate::core::file_system::FileSystemOperations;
use crate::core::models::{
    ChangeKind, ChangeNotification, CheckState, ChildEntry, ClearOutcome, LineRange, Node,
    WorkspaceEvent,
};
use crate::core::path_ownership::WorkspaceRoots;
use crate::core::pattern_matcher::{self, PatternRegistry};
use crate::core::selection_store::SelectionStore;
use crate::core::token_cache::TokenCache;
use crate::core::tokenizer_utils::{self, TokenCounterOperations};
use crate::core::tree_context::TreeContext;
use crate::core::watcher::{self, WorkspaceWatcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

pub const REFRESH_QUIET_PERIOD: Duration = Duration::from_secs(1);

pub struct WorkspaceSession {
    fs: Arc<dyn FileSystemOperations>,
    store: Arc<dyn BlobStoreOperations>,
    settings: WorkspaceSettings,
    roots: WorkspaceRoots,
    patterns: PatternRegistry,
    selection: SelectionStore,
    tokens: TokenCache,
    refresh_debouncer: Debouncer,
    pending_refresh_paths: Vec<PathBuf>,
    selection_dirty: bool,
    clear_prompt_offered: bool,
    event_sender: Sender<WorkspaceEvent>,
    event_receiver: Receiver<WorkspaceEvent>,
    subscribers: Vec<Sender<ChangeNotification>>,
    watcher: Option<WorkspaceWatcher>,
    disposed: bool,
}

impl WorkspaceSession {
    /*
     * Opens a session with the estimator named in `settings`. The persisted
     * token caches of the roots are loaded and the checked-paths list saved
     * for this root set is restored.
     */
    pub fn open(
        roots: Vec<PathBuf>,
        settings: WorkspaceSettings,
        fs: Arc<dyn FileSystemOperations>,
        store: Arc<dyn BlobStoreOperations>,
    ) -> Self {
        let counter = tokenizer_utils::create_token_counter(settings.token_estimator);
        Self::open_with_counter(roots, settings, fs, store, counter)
    }

    pub fn open_with_counter(
        roots: Vec<PathBuf>,
        settings: WorkspaceSettings,
        fs: Arc<dyn FileSystemOperations>,
        store: Arc<dyn BlobStoreOperations>,
        counter: Box<dyn TokenCounterOperations>,
    ) -> Self {
        let roots = WorkspaceRoots::new(roots);
        let patterns = PatternRegistry::load(roots.roots(), &settings);
        let mut tokens = TokenCache::new(counter, Arc::clone(&store));
        tokens.load_from_store(roots.roots());
        let (event_sender, event_receiver) = mpsc::channel();

        let mut session = WorkspaceSession {
            fs,
            store,
            settings,
            roots,
            patterns,
            selection: SelectionStore::new(),
            tokens,
            refresh_debouncer: Debouncer::new(REFRESH_QUIET_PERIOD),
            pending_refresh_paths: Vec::new(),
            selection_dirty: false,
            clear_prompt_offered: false,
            event_sender,
            event_receiver,
            subscribers: Vec::new(),
            watcher: None,
            disposed: false,
        };

        let saved = session.load_persisted_selection();
        if !saved.is_empty() {
            let ctx = TreeContext::new(session.fs.as_ref(), &session.roots, &session.patterns);
            session.selection.set_checked_paths(&ctx, &saved);
        }
        log::debug!(
            "WorkspaceSession: Opened with {} root(s), {} saved check(s).",
            session.roots.roots().len(),
            saved.len()
        );
        session
    }

    pub fn roots(&self) -> &[PathBuf] {
        self.roots.roots()
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    pub fn event_sender(&self) -> Sender<WorkspaceEvent> {
        self.event_sender.clone()
    }

    pub fn subscribe(&mut self) -> Receiver<ChangeNotification> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.push(sender);
        receiver
    }

    pub fn start_watching(&mut self) -> watcher::Result<()> {
        if self.watcher.is_none() && !self.disposed {
            self.watcher = Some(WorkspaceWatcher::start(
                self.roots.roots(),
                self.event_sender.clone(),
            )?);
        }
        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    // Applies every queued event in arrival order; returns how many ran.
    pub fn process_pending_events(&mut self) -> usize {
        if self.disposed {
            return 0;
        }
        let mut processed = 0;
        while let Ok(event) = self.event_receiver.try_recv() {
            self.handle_event(event);
            processed += 1;
        }
        if processed > 0 {
            log::trace!("WorkspaceSession: Processed {processed} queued event(s).");
        }
        processed
    }

    /*
     * Drives time-based work: drains the queue, fires a due refresh, saves a
     * changed selection and flushes the token cache when its debounce is due.
     */
    pub fn tick(&mut self, now: Instant) {
        if self.disposed {
            return;
        }
        self.process_pending_events();
        if self.refresh_debouncer.fire_if_due(now) {
            let paths = std::mem::take(&mut self.pending_refresh_paths);
            log::debug!("WorkspaceSession: Debounced refresh for {} path(s).", paths.len());
            self.notify(ChangeKind::Refresh, paths);
        }
        if self.selection_dirty {
            self.save_selection();
        }
        self.tokens.flush_if_due(now);
    }

    /*
     * Children of `parent` (or the workspace roots for `None`), excluded entries
     * removed, directories first and in natural order, each annotated with its
     * selection state and token counts.
     */
    pub fn enumerate_children(&mut self, parent: Option<&Path>) -> Vec<ChildEntry> {
        self.process_pending_events();
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        let nodes: Vec<Node> = match parent {
            None => self
                .roots
                .roots()
                .iter()
                .map(|root| Node::new(root.clone(), true, false))
                .collect(),
            Some(dir) => ctx.list_children(dir),
        };

        nodes
            .into_iter()
            .map(|node| {
                let check_state = self.selection.get_state(&node.path);
                let is_partial = self.selection.is_partial(&node.path);
                let (token_count, selected_token_count) = if node.is_directory {
                    let full = self.tokens.directory_tokens(&ctx, &node.path);
                    let selected =
                        self.tokens
                            .directory_selected_tokens(&ctx, &self.selection, &node.path);
                    (full, selected)
                } else {
                    let full = self.tokens.file_tokens(&ctx, &node.path);
                    (full, if check_state.is_checked() { full } else { 0 })
                };
                ChildEntry {
                    path: node.path,
                    name: node.name,
                    is_directory: node.is_directory,
                    is_symbolic_link: node.is_symbolic_link,
                    check_state,
                    is_partial,
                    token_count,
                    selected_token_count,
                }
            })
            .collect()
    }

    pub fn toggle(&mut self, path: &Path, new_state: CheckState) {
        self.process_pending_events();
        if self.disposed {
            return;
        }
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        let Some(meta) = ctx.metadata(path) else {
            log::warn!("WorkspaceSession: Cannot toggle {path:?}, it does not exist.");
            return;
        };
        let change = self
            .selection
            .set_checked(&ctx, path, new_state.is_checked(), meta.is_dir);
        if change.is_empty() {
            return;
        }
        self.tokens.apply_selection_change(&change);
        self.selection_dirty = true;

        let mut paths = vec![path.to_path_buf()];
        paths.extend(change.touched_directories);
        self.notify(ChangeKind::Selection, paths);
    }

    pub fn check_state(&mut self, path: &Path) -> CheckState {
        self.process_pending_events();
        self.selection.get_state(path)
    }

    pub fn is_partial(&mut self, path: &Path) -> bool {
        self.process_pending_events();
        self.selection.is_partial(path)
    }

    pub fn get_checked_files(&mut self) -> Vec<PathBuf> {
        self.process_pending_events();
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        self.selection.get_checked_files(&ctx)
    }

    pub fn file_tokens(&mut self, path: &Path) -> usize {
        self.process_pending_events();
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        self.tokens.file_tokens(&ctx, path)
    }

    pub fn directory_tokens(&mut self, dir: &Path) -> usize {
        self.process_pending_events();
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        self.tokens.directory_tokens(&ctx, dir)
    }

    pub fn directory_selected_tokens(&mut self, dir: &Path) -> usize {
        self.process_pending_events();
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        self.tokens
            .directory_selected_tokens(&ctx, &self.selection, dir)
    }

    // Sum of the token counts of every checked file.
    pub fn selected_token_total(&mut self) -> usize {
        let files = self.get_checked_files();
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        files
            .iter()
            .map(|file| self.tokens.file_tokens(&ctx, file))
            .sum()
    }

    /*
     * "Clear all checks" under the configured policy. With
     * `PreserveOpenEditors`, checked files listed in `open_paths` survive; the
     * first time this happens in a session the outcome asks the UI to offer
     * clearing those as well (see `clear_preserved_checks`).
     */
    pub fn clear_all_checks(&mut self, open_paths: &[PathBuf]) -> ClearOutcome {
        self.process_pending_events();
        if self.settings.clear_behavior == ClearBehavior::ClearAll {
            self.clear_every_check();
            return ClearOutcome::Cleared;
        }

        let open: HashSet<&PathBuf> = open_paths.iter().collect();
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        let preserved: Vec<PathBuf> = self
            .selection
            .get_checked_files(&ctx)
            .into_iter()
            .filter(|path| open.contains(path))
            .collect();
        if preserved.is_empty() {
            self.clear_every_check();
            return ClearOutcome::Cleared;
        }

        let change = self.selection.set_checked_paths(&ctx, &preserved);
        self.tokens.apply_selection_change(&change);
        self.selection_dirty = true;
        let offer_clear_preserved = !self.clear_prompt_offered;
        self.clear_prompt_offered = true;
        log::debug!(
            "WorkspaceSession: Cleared checks, preserving {} open file(s).",
            preserved.len()
        );
        self.notify(ChangeKind::Selection, preserved.clone());
        ClearOutcome::Preserved {
            preserved,
            offer_clear_preserved,
        }
    }

    pub fn clear_preserved_checks(&mut self) {
        self.process_pending_events();
        self.clear_every_check();
    }

    /*
     * Replaces the root set. The selection of the old root set is saved under
     * its own key; checks that still fall inside the new roots are kept and
     * merged with the selection saved for the new root set.
     */
    pub fn set_roots(&mut self, roots: Vec<PathBuf>) {
        if self.disposed {
            return;
        }
        if self.selection_dirty {
            self.save_selection();
        }
        let mut kept = self.selection.checked_paths();

        self.roots.set_roots(roots);
        self.patterns = PatternRegistry::load(self.roots.roots(), &self.settings);
        self.tokens.reload_roots(self.roots.roots());
        kept.extend(self.load_persisted_selection());

        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        self.selection.set_checked_paths(&ctx, &kept);
        self.tokens.invalidate_all_selected();
        self.selection_dirty = true;
        self.refresh_debouncer.cancel();
        self.pending_refresh_paths.clear();

        if self.watcher.take().is_some() {
            if let Err(e) = self.start_watching() {
                log::warn!("WorkspaceSession: Failed to watch the new roots: {e}");
            }
        }
        self.notify(ChangeKind::Full, self.roots.roots().to_vec());
    }

    pub fn apply_settings(&mut self, settings: WorkspaceSettings) {
        if self.disposed {
            return;
        }
        let previous = std::mem::replace(&mut self.settings, settings);
        if previous.exclusion_rules_differ(&self.settings) {
            log::debug!("WorkspaceSession: Exclusion patterns changed; reloading matchers.");
            self.patterns = PatternRegistry::load(self.roots.roots(), &self.settings);
            self.after_exclusion_change();
        }
        if previous.token_estimator != self.settings.token_estimator {
            log::debug!(
                "WorkspaceSession: Token estimator changed to {:?}.",
                self.settings.token_estimator
            );
            self.tokens
                .set_token_counter(tokenizer_utils::create_token_counter(
                    self.settings.token_estimator,
                ));
            self.notify(ChangeKind::Full, Vec::new());
        }
    }

    pub fn set_line_range(&mut self, path: &Path, range: Option<LineRange>) {
        self.process_pending_events();
        if self.tokens.set_line_range(path, range) {
            self.notify(ChangeKind::Full, vec![path.to_path_buf()]);
        }
    }

    pub fn line_range(&self, path: &Path) -> Option<LineRange> {
        self.tokens.line_range(path)
    }

    pub fn save_selection(&mut self) {
        if self.disposed {
            return;
        }
        let document = PersistedSelection::new(self.selection.checked_paths());
        let key = checksum_utils::selection_key_for_roots(self.roots.roots());
        let result = document
            .encode()
            .and_then(|blob| self.store.save_blob(&key, &blob));
        match result {
            Ok(()) => {
                self.selection_dirty = false;
                log::debug!(
                    "WorkspaceSession: Saved {} checked path(s).",
                    document.checked_paths.len()
                );
            }
            Err(e) => log::warn!("WorkspaceSession: Failed to save the selection: {e}"),
        }
    }

    // Writes everything pending right away; used before an orderly shutdown.
    pub fn flush(&mut self) {
        self.process_pending_events();
        if self.selection_dirty {
            self.save_selection();
        }
        self.tokens.flush_now();
    }

    /*
     * Ends the session: pending timers are cancelled, the watcher is stopped and
     * no durable write happens afterwards. Call `flush` first to keep pending
     * state.
     */
    pub fn dispose(&mut self) {
        self.refresh_debouncer.cancel();
        self.pending_refresh_paths.clear();
        self.watcher = None;
        self.tokens.dispose();
        self.disposed = true;
        log::debug!("WorkspaceSession: Disposed.");
    }

    fn handle_event(&mut self, event: WorkspaceEvent) {
        match event {
            WorkspaceEvent::FileCreated(path)
            | WorkspaceEvent::FileChanged(path)
            | WorkspaceEvent::FileDeleted(path)
                if pattern_matcher::is_ignore_file(&path) =>
            {
                self.on_ignore_file_changed(&path)
            }
            WorkspaceEvent::FileCreated(path) => self.on_file_created(&path),
            WorkspaceEvent::FileChanged(path) => self.on_file_changed(&path),
            WorkspaceEvent::FileDeleted(path) => self.on_file_deleted(&path),
            WorkspaceEvent::IgnoreFileChanged(path) => self.on_ignore_file_changed(&path),
            WorkspaceEvent::SettingsChanged(settings) => self.apply_settings(settings),
            WorkspaceEvent::RootsChanged(roots) => self.set_roots(roots),
        }
    }

    fn on_file_created(&mut self, path: &Path) {
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        if self.roots.resolve(path).is_none() {
            log::trace!("WorkspaceSession: Ignoring creation outside the workspace: {path:?}");
            return;
        }
        let Some(meta) = ctx.metadata(path) else {
            return;
        };
        if ctx.is_excluded(path, meta.is_dir) {
            log::trace!("WorkspaceSession: Ignoring creation of excluded path {path:?}.");
            return;
        }

        self.tokens.invalidate_for_changed_file(&self.roots, path);
        let change = if self.settings.auto_check_new_files {
            self.selection_dirty = true;
            self.selection.set_checked(&ctx, path, true, meta.is_dir)
        } else {
            self.selection.refresh_ancestors(&ctx, path)
        };
        self.tokens.apply_selection_change(&change);
        self.schedule_refresh(path);
    }

    fn on_file_changed(&mut self, path: &Path) {
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        let is_dir = ctx.metadata(path).is_some_and(|meta| meta.is_dir);
        if ctx.is_excluded(path, is_dir) || self.parent_is_excluded(path) {
            log::trace!("WorkspaceSession: Ignoring change of excluded path {path:?}.");
            return;
        }
        self.tokens.invalidate_for_changed_file(&self.roots, path);
        self.schedule_refresh(path);
    }

    fn on_file_deleted(&mut self, path: &Path) {
        // An excluded path was never counted; only stored checks need cleaning up.
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        let excluded = ctx.is_excluded(path, false) || self.parent_is_excluded(path);
        if excluded && !self.selection.has_state_under(path) {
            log::trace!("WorkspaceSession: Ignoring deletion of excluded path {path:?}.");
            return;
        }
        self.tokens.invalidate_for_changed_file(&self.roots, path);
        if self.selection.has_state_under(path) {
            self.selection_dirty = true;
        }
        let change = self.selection.remove_path(&ctx, path);
        self.tokens.apply_selection_change(&change);
        self.schedule_refresh(path);
    }

    fn on_ignore_file_changed(&mut self, path: &Path) {
        let Some(root) = self.roots.resolve(path) else {
            return;
        };
        // Rules inside an excluded directory cannot re-include anything.
        if self.parent_is_excluded(path) {
            log::trace!("WorkspaceSession: Ignoring ignore file {path:?} in an excluded directory.");
            return;
        }
        log::debug!("WorkspaceSession: Ignore file {path:?} changed; reloading rules for {root:?}.");
        self.patterns.reload_root(&root, &self.settings);
        self.after_exclusion_change();
    }

    // Exclusion rules changed: every aggregate is suspect, refresh right away.
    fn after_exclusion_change(&mut self) {
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        let change = self.selection.uncheck_excluded(&ctx);
        if !change.cascaded_subtrees.is_empty() {
            self.selection_dirty = true;
        }
        self.tokens.clear_caches();
        self.refresh_debouncer.cancel();
        let mut paths = std::mem::take(&mut self.pending_refresh_paths);
        paths.extend(change.cascaded_subtrees);
        self.notify(ChangeKind::Full, paths);
    }

    fn clear_every_check(&mut self) {
        if self.selection.is_empty() {
            return;
        }
        self.selection.clear();
        self.tokens.invalidate_all_selected();
        self.selection_dirty = true;
        log::debug!("WorkspaceSession: Cleared every check.");
        self.notify(ChangeKind::Selection, self.roots.roots().to_vec());
    }

    fn parent_is_excluded(&self, path: &Path) -> bool {
        if self.roots.is_root(path) {
            return false;
        }
        let ctx = TreeContext::new(self.fs.as_ref(), &self.roots, &self.patterns);
        path.parent().is_some_and(|parent| ctx.is_excluded(parent, true))
    }

    fn schedule_refresh(&mut self, path: &Path) {
        self.refresh_debouncer.schedule(Instant::now());
        self.pending_refresh_paths.push(path.to_path_buf());
    }

    fn load_persisted_selection(&self) -> Vec<PathBuf> {
        let key = checksum_utils::selection_key_for_roots(self.roots.roots());
        match self.store.load_blob(&key) {
            Ok(Some(blob)) => match PersistedSelection::decode(&blob) {
                Ok(document) => document.checked_paths,
                Err(e) => {
                    log::warn!("WorkspaceSession: Discarding corrupted saved selection: {e}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("WorkspaceSession: Failed to load the saved selection: {e}");
                Vec::new()
            }
        }
    }

    fn notify(&mut self, kind: ChangeKind, paths: Vec<PathBuf>) {
        let notification = ChangeNotification { kind, paths };
        self.subscribers
            .retain(|subscriber| subscriber.send(notification.clone()).is_ok());
    }
}
