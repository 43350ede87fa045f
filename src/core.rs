/*
 * This module consolidates the platform-agnostic engine of the application.
 * It re-exports key data structures and the abstractions the engine is built
 * around (`FileSystemOperations`, `TokenCounterOperations`,
 * `BlobStoreOperations`, `ConfigManagerOperations`) together with the concrete
 * components: pattern matching, root ownership, the selection store, the token
 * cache, and the `WorkspaceSession` orchestrator that wires them to filesystem
 * events.
 */
pub mod checksum_utils;
pub mod config;
pub mod debounce;
pub mod durable_store;
pub mod envelope;
pub mod file_system;
pub mod models;
pub mod orchestrator;
pub mod path_ownership;
pub mod path_utils;
pub mod pattern_matcher;
pub mod selection_store;
pub mod token_cache;
pub mod tokenizer_utils;
pub mod tree_context;
pub mod watcher;

// Re-export key structures and enums
pub use models::{
    ChangeKind, ChangeNotification, CheckState, ChildEntry, ClearOutcome, LineRange, Node,
    WorkspaceEvent,
};

pub use file_system::{CoreFileSystem, FileMetadata, FileSystemError, FileSystemOperations};

pub use pattern_matcher::{PatternMatcher, PatternRegistry};

pub use path_ownership::WorkspaceRoots;

pub use selection_store::{SelectionChange, SelectionStore};

pub use token_cache::TokenCache;

pub use tokenizer_utils::{ByteRatioTokenEstimator, CoreTikTokenCounter, TokenCounterOperations};

pub use durable_store::{BlobStoreOperations, CoreBlobStore, StoreError};

pub use config::{
    ClearBehavior, ConfigError, ConfigManagerOperations, CoreConfigManager, TokenEstimatorKind,
    WorkspaceSettings,
};

pub use debounce::Debouncer;

pub use tree_context::TreeContext;

pub use orchestrator::WorkspaceSession;

pub use watcher::{WatchError, WorkspaceWatcher};
