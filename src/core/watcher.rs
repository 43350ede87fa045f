/*
 * Filesystem watching over `notify`. The watcher callback runs on notify's own
 * thread and never touches the session: it only translates raw events into
 * `WorkspaceEvent`s and pushes them into the session's ordered queue. Any
 * change to a file named like an ignore file is reported as
 * `IgnoreFileChanged`, whatever its raw kind.
 */
use crate::core::models::WorkspaceEvent;
use crate::core::pattern_matcher;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use std::path::PathBuf;
use std::sync::mpsc::Sender;

#[derive(Debug)]
pub enum WatchError {
    Notify(notify::Error),
}

impl From<notify::Error> for WatchError {
    fn from(err: notify::Error) -> Self {
        WatchError::Notify(err)
    }
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Notify(e) => write!(f, "Filesystem watcher error: {e}"),
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Notify(e) => Some(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;

// Watching stops when this value is dropped.
pub struct WorkspaceWatcher {
    _watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl WorkspaceWatcher {
    pub fn start(roots: &[PathBuf], events: Sender<WorkspaceEvent>) -> Result<Self> {
        let mut watcher = recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) => {
                for workspace_event in translate_event(&event) {
                    if events.send(workspace_event).is_err() {
                        log::trace!("WorkspaceWatcher: Session queue closed; dropping event.");
                        return;
                    }
                }
            }
            Err(e) => log::warn!("WorkspaceWatcher: Watch error: {e}"),
        })?;

        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            log::debug!("WorkspaceWatcher: Watching {root:?}.");
        }
        Ok(WorkspaceWatcher {
            _watcher: watcher,
            roots: roots.to_vec(),
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

/*
 * Maps one raw notify event to session events. Access events are dropped.
 * A rename is split into a deletion of the old path and a creation of the new
 * one; a rename whose direction is unknown is resolved by checking whether the
 * path still exists.
 */
pub fn translate_event(event: &Event) -> Vec<WorkspaceEvent> {
    let mut translated = Vec::new();
    match &event.kind {
        EventKind::Create(_) => {
            translated.extend(event.paths.iter().cloned().map(WorkspaceEvent::FileCreated));
        }
        EventKind::Remove(_) => {
            translated.extend(event.paths.iter().cloned().map(WorkspaceEvent::FileDeleted));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            translated.extend(event.paths.iter().cloned().map(WorkspaceEvent::FileDeleted));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            translated.extend(event.paths.iter().cloned().map(WorkspaceEvent::FileCreated));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            translated.push(WorkspaceEvent::FileDeleted(event.paths[0].clone()));
            translated.push(WorkspaceEvent::FileCreated(event.paths[1].clone()));
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            for path in &event.paths {
                translated.push(if path.exists() {
                    WorkspaceEvent::FileCreated(path.clone())
                } else {
                    WorkspaceEvent::FileDeleted(path.clone())
                });
            }
        }
        EventKind::Modify(_) | EventKind::Any => {
            translated.extend(event.paths.iter().cloned().map(WorkspaceEvent::FileChanged));
        }
        EventKind::Access(_) | EventKind::Other => {}
    }

    translated
        .into_iter()
        .map(|e| match e {
            WorkspaceEvent::FileCreated(p)
            | WorkspaceEvent::FileChanged(p)
            | WorkspaceEvent::FileDeleted(p)
                if pattern_matcher::is_ignore_file(&p) =>
            {
                WorkspaceEvent::IgnoreFileChanged(p)
            }
            other => other,
        })
        .collect()
}
