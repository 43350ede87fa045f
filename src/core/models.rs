use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::config::WorkspaceSettings;

/*
 * Stored selection state of a single path. Directories may additionally be
 * flagged partial by the selection store, but partial is a derived display
 * state and never a value of this enum.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CheckState {
    #[default]
    Unchecked,
    Checked,
}

impl CheckState {
    pub fn from_checked(checked: bool) -> Self {
        if checked {
            CheckState::Checked
        } else {
            CheckState::Unchecked
        }
    }

    pub fn is_checked(self) -> bool {
        self == CheckState::Checked
    }
}

/*
 * An entry of a directory listing. Nodes are ephemeral: they are re-derived from
 * the filesystem on every expand and never kept as an object graph. Only scalar
 * values derived from them (states, token counts) are cached, keyed by path.
 * For a symbolic link, `is_directory` describes the link target.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub path: PathBuf,
    pub name: String,
    pub is_directory: bool,
    pub is_symbolic_link: bool,
}

impl Node {
    pub fn new(path: PathBuf, is_directory: bool, is_symbolic_link: bool) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Node {
            path,
            name,
            is_directory,
            is_symbolic_link,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/*
 * One row handed to the tree UI by `WorkspaceSession::enumerate_children`.
 * For files, `selected_token_count` is either `token_count` or zero; for
 * directories it is the selected-subset aggregate.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub path: PathBuf,
    pub name: String,
    pub is_directory: bool,
    pub is_symbolic_link: bool,
    pub check_state: CheckState,
    pub is_partial: bool,
    pub token_count: usize,
    pub selected_token_count: usize,
}

/*
 * A 1-based, inclusive line range restricting which part of a file is counted.
 * `end` past the end of the file is clamped; a range starting past the end
 * yields empty content.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        LineRange {
            start: start.max(1),
            end: end.max(start.max(1)),
        }
    }
}

/*
 * Everything that mutates the tree arrives as one of these events, through the
 * session's single ordered queue. Watcher callbacks only ever produce events;
 * they never touch the session directly.
 */
#[derive(Debug, Clone)]
pub enum WorkspaceEvent {
    FileCreated(PathBuf),
    FileChanged(PathBuf),
    FileDeleted(PathBuf),
    IgnoreFileChanged(PathBuf),
    SettingsChanged(WorkspaceSettings),
    RootsChanged(Vec<PathBuf>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    // A checkbox changed; counts of the listed paths' ancestors are stale.
    Selection,
    // Debounced refresh after filesystem activity.
    Refresh,
    // Exclusion rules, roots or settings changed; re-render everything.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub kind: ChangeKind,
    pub paths: Vec<PathBuf>,
}

/*
 * Result of "clear all checks". With the preserve-open-editors policy the
 * preserved paths are reported back, and `offer_clear_preserved` is true the
 * first time in a session so the UI can ask whether to clear those as well.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared,
    Preserved {
        preserved: Vec<PathBuf>,
        offer_clear_preserved: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_new_derives_name_from_path() {
        let node = Node::new(PathBuf::from("/ws/src/main.rs"), false, false);
        assert_eq!(node.name, "main.rs");
        assert!(!node.is_directory);
        assert!(!node.is_symbolic_link);
    }

    #[test]
    fn test_check_state_defaults_to_unchecked() {
        assert_eq!(CheckState::default(), CheckState::Unchecked);
        assert!(CheckState::from_checked(true).is_checked());
        assert!(!CheckState::from_checked(false).is_checked());
    }

    #[test]
    fn test_line_range_new_normalizes_bounds() {
        assert_eq!(LineRange::new(0, 0), LineRange { start: 1, end: 1 });
        assert_eq!(LineRange::new(5, 2), LineRange { start: 5, end: 5 });
        assert_eq!(LineRange::new(2, 9), LineRange { start: 2, end: 9 });
    }
}
