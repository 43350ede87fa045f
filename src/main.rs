/*
 * `ctxtree` command line front end. Opens a session over the given roots,
 * applies the requested check changes, prints the annotated tree and the
 * checked files, and optionally keeps watching the roots for changes.
 */
use clap::Parser;
use ctxtree::core::durable_store::BlobStoreOperations;
use ctxtree::{
    APP_NAME, ChangeKind, CheckState, ChildEntry, ClearOutcome, ConfigManagerOperations,
    CoreBlobStore, CoreConfigManager, CoreFileSystem, WorkspaceSession, WorkspaceSettings,
};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(
    name = "ctxtree",
    version,
    about = "Workspace context tree with token accounting"
)]
struct Cli {
    /// Workspace roots to open
    #[arg(required = true)]
    roots: Vec<PathBuf>,

    /// Check a file or directory before printing
    #[arg(long, value_name = "PATH")]
    check: Vec<PathBuf>,

    /// Uncheck a file or directory before printing
    #[arg(long, value_name = "PATH")]
    uncheck: Vec<PathBuf>,

    /// Clear all checks first, preserving the given paths when the
    /// preserve-open-editors policy is configured
    #[arg(long)]
    clear: bool,

    /// Paths treated as open in an editor when clearing
    #[arg(long, value_name = "PATH")]
    open: Vec<PathBuf>,

    /// How many directory levels to print
    #[arg(long, default_value_t = 2)]
    depth: usize,

    /// Keep running and report changes until Enter is pressed
    #[arg(short, long)]
    watch: bool,

    /// Directory holding settings.json and the token cache
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Also write a trace-level log to this file
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    ctxtree::initialize_logging_with_file(cli.log_file.as_deref());

    let roots = match canonical_roots(&cli.roots) {
        Ok(roots) => roots,
        Err(message) => {
            eprintln!("ctxtree: {message}");
            return ExitCode::from(2);
        }
    };

    let (settings, store) = match open_collaborators(cli.config_dir.as_deref()) {
        Ok(pair) => pair,
        Err(message) => {
            eprintln!("ctxtree: {message}");
            return ExitCode::FAILURE;
        }
    };

    let mut session =
        WorkspaceSession::open(roots, settings, Arc::new(CoreFileSystem::new()), store);

    if cli.clear {
        let open = absolute_paths(&cli.open);
        if let ClearOutcome::Preserved { preserved, .. } = session.clear_all_checks(&open) {
            println!("Kept {} check(s) on open files.", preserved.len());
        }
    }
    for path in absolute_paths(&cli.uncheck) {
        session.toggle(&path, CheckState::Unchecked);
    }
    for path in absolute_paths(&cli.check) {
        session.toggle(&path, CheckState::Checked);
    }

    print_report(&mut session, cli.depth);

    if cli.watch {
        if let Err(e) = session.start_watching() {
            eprintln!("ctxtree: {e}");
            session.flush();
            session.dispose();
            return ExitCode::FAILURE;
        }
        watch_loop(&mut session, cli.depth, spawn_stop_listener());
    }

    session.flush();
    session.dispose();
    ExitCode::SUCCESS
}

fn canonical_roots(roots: &[PathBuf]) -> Result<Vec<PathBuf>, String> {
    roots
        .iter()
        .map(|root| {
            std::fs::canonicalize(root)
                .map_err(|e| format!("cannot open workspace root {}: {e}", root.display()))
        })
        .collect()
}

// Relative paths on the command line are resolved against the working directory.
fn absolute_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|path| std::fs::canonicalize(path).unwrap_or_else(|_| path.clone()))
        .collect()
}

fn open_collaborators(
    config_dir: Option<&Path>,
) -> Result<(WorkspaceSettings, Arc<dyn BlobStoreOperations>), String> {
    let (config, store) = match config_dir {
        Some(dir) => (
            CoreConfigManager::with_directory(dir.to_path_buf()),
            CoreBlobStore::new(dir.join("token_cache")),
        ),
        None => (
            CoreConfigManager::for_app(APP_NAME).map_err(|e| e.to_string())?,
            CoreBlobStore::for_app(APP_NAME).map_err(|e| e.to_string())?,
        ),
    };
    let settings = config.load_settings().unwrap_or_else(|e| {
        log::warn!("ctxtree: Failed to load settings, using defaults: {e}");
        WorkspaceSettings::default()
    });
    let store: Arc<dyn BlobStoreOperations> = Arc::new(store);
    Ok((settings, store))
}

fn print_report(session: &mut WorkspaceSession, depth: usize) {
    for root in session.enumerate_children(None) {
        print_entry(&root, 0);
        print_tree(session, &root.path, 1, depth);
    }

    let checked = session.get_checked_files();
    println!();
    println!("Checked files ({}):", checked.len());
    for file in &checked {
        println!("  {}", file.display());
    }
    println!("Selected tokens: {}", session.selected_token_total());
}

fn print_tree(session: &mut WorkspaceSession, dir: &Path, level: usize, max_depth: usize) {
    if level > max_depth {
        return;
    }
    for child in session.enumerate_children(Some(dir)) {
        print_entry(&child, level);
        if child.is_directory {
            print_tree(session, &child.path, level + 1, max_depth);
        }
    }
}

fn print_entry(entry: &ChildEntry, level: usize) {
    let mark = match (entry.check_state, entry.is_partial) {
        (CheckState::Checked, _) => "[x]",
        (CheckState::Unchecked, true) => "[-]",
        (CheckState::Unchecked, false) => "[ ]",
    };
    let suffix = if entry.is_directory { "/" } else { "" };
    println!(
        "{}{mark} {}{suffix}  {} / {} tokens",
        "  ".repeat(level),
        entry.name,
        entry.selected_token_count,
        entry.token_count
    );
}

/*
 * Reprints the report whenever a refresh lands. Pressing Enter ends the loop
 * so the caller can flush; Ctrl+C terminates the process and drops token
 * counts still waiting for the debounced write.
 */
fn watch_loop(session: &mut WorkspaceSession, depth: usize, stop: Receiver<()>) {
    let notifications = session.subscribe();
    println!();
    println!("Watching for changes (press Enter to stop)...");
    loop {
        thread::sleep(WATCH_POLL_INTERVAL);
        session.tick(Instant::now());
        let kinds: Vec<ChangeKind> = notifications.try_iter().map(|n| n.kind).collect();
        if kinds
            .iter()
            .any(|kind| matches!(kind, ChangeKind::Refresh | ChangeKind::Full))
        {
            println!();
            print_report(session, depth);
        }
        if stop.try_recv().is_ok() {
            log::debug!("ctxtree: Stop requested, leaving watch mode.");
            return;
        }
    }
}

// Sends once a line is read from stdin. End of input never stops the loop.
fn spawn_stop_listener() -> Receiver<()> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut line = String::new();
        match io::stdin().read_line(&mut line) {
            Ok(0) => log::debug!("ctxtree: Stdin closed; only Ctrl+C ends watch mode."),
            Ok(_) => {
                let _ = sender.send(());
            }
            Err(e) => log::warn!("ctxtree: Failed to read stdin: {e}"),
        }
    });
    receiver
}
