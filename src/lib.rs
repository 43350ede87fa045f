/*
 * ctxtree: a workspace context tree and token-accounting engine.
 *
 * The library tracks a tri-state checked/unchecked/partial selection over one or
 * more workspace roots, keeps per-file and per-directory token estimates in
 * path-keyed caches, honours ignore files plus user allow/deny patterns, and
 * keeps all derived counts consistent as filesystem events arrive. Everything
 * lives under `core`; this file only re-exports the public surface and owns the
 * logging bootstrap shared by the binary and the tests.
 */
pub mod core;

pub use crate::core::{
    ByteRatioTokenEstimator, ChangeKind, ChangeNotification, CheckState, ChildEntry,
    ClearBehavior, ClearOutcome, ConfigManagerOperations, CoreBlobStore, CoreConfigManager,
    CoreFileSystem, CoreTikTokenCounter, FileSystemOperations, LineRange, Node,
    TokenCounterOperations, TokenEstimatorKind, WorkspaceEvent, WorkspaceSession,
    WorkspaceSettings, WorkspaceWatcher,
};

use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::sync::Once;

pub const APP_NAME: &str = "ctxtree";

// Environment variable that overrides the terminal log level ("info", "debug", ...).
const LOG_LEVEL_ENV_VAR: &str = "CTXTREE_LOG";

static LOGGING_INIT: Once = Once::new();

/*
 * Installs the terminal logger once per process. Safe to call from every test;
 * only the first call has any effect.
 */
pub fn initialize_logging() {
    initialize_logging_with_file(None);
}

/*
 * Installs a combined logger: a terminal logger at the level taken from
 * `CTXTREE_LOG` (default `info`), plus a trace-level file logger when a log file
 * path is supplied. Failure to create the log file or to install the logger is
 * reported on stderr and otherwise ignored, since logging must never take the
 * host down.
 */
pub fn initialize_logging_with_file(log_file: Option<&Path>) {
    LOGGING_INIT.call_once(|| {
        let term_level = std::env::var(LOG_LEVEL_ENV_VAR)
            .ok()
            .and_then(|value| LevelFilter::from_str(&value).ok())
            .unwrap_or(LevelFilter::Info);

        let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
            term_level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )];

        if let Some(path) = log_file {
            match File::create(path) {
                Ok(file) => loggers.push(WriteLogger::new(
                    LevelFilter::Trace,
                    Config::default(),
                    file,
                )),
                Err(e) => eprintln!("ctxtree: could not create log file {path:?}: {e}"),
            }
        }

        if let Err(e) = CombinedLogger::init(loggers) {
            eprintln!("ctxtree: logger already installed or failed to initialize: {e}");
        }
    });
}
