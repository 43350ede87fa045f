/*
 * This module provides utility functions for path manipulation: locating the
 * application's local configuration directory, walking the ancestors of a path
 * up to its workspace root, and the numeric-aware ordering used for every list
 * the engine hands out.
 */
use crate::core::models::Node;
use directories::ProjectDirs;
use std::cmp::Ordering;
use std::fs;
use std::path::{Component, Path, PathBuf};

/*
 * Retrieves the application's primary local configuration directory, creating
 * it if necessary. The path is derived without an organization qualifier
 * (e.g. `~/.config/<app>` on Linux, `AppData/Local/<app>` on Windows).
 *
 * Returns `None` if the directory could not be determined or created.
 */
pub fn get_base_app_config_local_dir(app_name: &str) -> Option<PathBuf> {
    log::trace!("PathUtils: Attempting to get base app config local dir for '{app_name}'");
    ProjectDirs::from("", "", app_name).and_then(|proj_dirs| {
        let config_path = proj_dirs.config_local_dir();
        if !config_path.exists() {
            if let Err(e) = fs::create_dir_all(config_path) {
                log::error!(
                    "PathUtils: Failed to create base app config directory {config_path:?}: {e}"
                );
                return None;
            }
            log::debug!("PathUtils: Created base app config directory: {config_path:?}");
        }
        Some(config_path.to_path_buf())
    })
}

/*
 * Numeric-aware comparison of two file names: "file2" sorts before "file10".
 * Case is ignored first and only used to break ties, so the order is total.
 */
pub fn compare_names_naturally(a: &str, b: &str) -> Ordering {
    natord::compare_ignore_case(a, b).then_with(|| natord::compare(a, b))
}

/*
 * Compares two paths component by component using the natural name order.
 * A path sorts before any of its descendants.
 */
pub fn compare_paths_naturally(a: &Path, b: &Path) -> Ordering {
    let mut a_components = a.components();
    let mut b_components = b.components();
    loop {
        match (a_components.next(), b_components.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) => {
                let ordering = compare_names_naturally(
                    &ca.as_os_str().to_string_lossy(),
                    &cb.as_os_str().to_string_lossy(),
                );
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

// Directories before files, each group in natural name order.
pub fn sort_nodes_for_display(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| match (a.is_directory, b.is_directory) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => compare_names_naturally(&a.name, &b.name),
    });
}

/*
 * Returns the strict ancestors of `path` from the nearest parent up to and
 * including `root`. Empty if `path` is the root itself or lies outside it.
 */
pub fn ancestors_up_to_root(path: &Path, root: &Path) -> Vec<PathBuf> {
    if path == root || !path.starts_with(root) {
        return Vec::new();
    }
    path.ancestors()
        .skip(1)
        .take_while(|ancestor| ancestor.starts_with(root))
        .map(Path::to_path_buf)
        .collect()
}

// Number of normal components; used to process directories deepest first.
pub fn path_depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}
