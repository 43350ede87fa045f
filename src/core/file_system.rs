use crate::core::models::Node;
use crate::core::path_utils;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/*
 * This module provides the filesystem primitives the engine consumes: directory
 * listing with file-type and symlink flags, stat, text read and path
 * canonicalization. The `FileSystemOperations` trait keeps the engine
 * independent of the host; `CoreFileSystem` is the `std::fs` implementation.
 */

/*
 * Errors raised by the filesystem collaborator.
 * Callers in the engine never propagate these to the UI: every error is logged
 * and degraded to an empty listing or a zero count.
 */
#[derive(Debug)]
pub enum FileSystemError {
    Io(io::Error),
    InvalidPath(PathBuf),
}

impl From<io::Error> for FileSystemError {
    fn from(err: io::Error) -> Self {
        FileSystemError::Io(err)
    }
}

impl std::fmt::Display for FileSystemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSystemError::Io(e) => write!(f, "I/O error: {e}"),
            FileSystemError::InvalidPath(p) => write!(f, "Invalid path: {p:?}"),
        }
    }
}

impl std::error::Error for FileSystemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FileSystemError::Io(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FileSystemError>;

/*
 * Result of a stat that follows symbolic links. `modified_at` is expressed in
 * nanoseconds since the Unix epoch so that it can be stored and compared as a
 * plain integer in the token cache.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub is_dir: bool,
    pub is_file: bool,
    pub len: u64,
    pub modified_at: u64,
}

/*
 * Defines the filesystem operations the engine depends on.
 * `list_directory` returns the immediate children of a directory, omitting
 * broken symbolic links, ordered directories first and then in natural order.
 * `metadata` follows symbolic links.
 */
pub trait FileSystemOperations: Send + Sync {
    fn list_directory(&self, dir: &Path) -> Result<Vec<Node>>;
    fn metadata(&self, path: &Path) -> Result<FileMetadata>;
    fn read_text(&self, path: &Path) -> Result<String>;
    fn canonicalize(&self, path: &Path) -> Result<PathBuf>;
}

pub struct CoreFileSystem {}

impl CoreFileSystem {
    pub fn new() -> Self {
        CoreFileSystem {}
    }
}

impl Default for CoreFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

pub fn system_time_to_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

impl FileSystemOperations for CoreFileSystem {
    fn list_directory(&self, dir: &Path) -> Result<Vec<Node>> {
        if !dir.is_dir() {
            return Err(FileSystemError::InvalidPath(dir.to_path_buf()));
        }

        let mut nodes = Vec::new();
        for entry_result in fs::read_dir(dir)? {
            let entry = entry_result?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_symlink() {
                match fs::metadata(&path) {
                    Ok(target) => nodes.push(Node::new(path, target.is_dir(), true)),
                    Err(e) => {
                        log::trace!("CoreFileSystem: Skipping broken symbolic link {path:?}: {e}");
                    }
                }
            } else {
                nodes.push(Node::new(path, file_type.is_dir(), false));
            }
        }

        path_utils::sort_nodes_for_display(&mut nodes);
        log::trace!(
            "CoreFileSystem: Listed {} entries in {:?}.",
            nodes.len(),
            dir
        );
        Ok(nodes)
    }

    fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let meta = fs::metadata(path)?;
        Ok(FileMetadata {
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            len: meta.len(),
            modified_at: system_time_to_nanos(meta.modified()?),
        })
    }

    fn read_text(&self, path: &Path) -> Result<String> {
        let bytes = fs::read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::canonicalize(path)?)
    }
}
