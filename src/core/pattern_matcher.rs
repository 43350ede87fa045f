/*
 * This module combines every exclusion source of a workspace root into a single
 * predicate. Rules are evaluated in a fixed order:
 *
 * 1. Anything inside a `.git` directory is always excluded.
 * 2. User allow patterns force inclusion.
 * 3. Ignore files (`.gitignore`, `.ignore`) found at any depth, each anchored to
 *    the directory holding it, deepest file first. A negated rule (`!keep.me`)
 *    stops the ignore-file evaluation for that path.
 * 4. User deny patterns, anchored at the workspace root.
 * 5. Built-in default deny patterns.
 *
 * All patterns use gitignore syntax via the `ignore` crate, and a path is also
 * excluded when one of its parent directories is. A malformed pattern is logged
 * and skipped; building a matcher never fails.
 */
use crate::core::config::WorkspaceSettings;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const IGNORE_FILE_NAMES: [&str; 2] = [".ignore", ".gitignore"];

const VCS_DIR_NAME: &str = ".git";

pub const DEFAULT_DENY_PATTERNS: [&str; 7] = [
    "node_modules/",
    ".DS_Store",
    "Thumbs.db",
    "__pycache__/",
    "*.pyc",
    ".svn/",
    ".hg/",
];

pub fn is_ignore_file(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| IGNORE_FILE_NAMES.contains(&name))
}

// Rules read from one ignore file, anchored at the directory that holds it.
struct IgnoreFileRules {
    dir: PathBuf,
    source: PathBuf,
    rules: Gitignore,
}

pub struct PatternMatcher {
    root: PathBuf,
    ignore_files: Vec<IgnoreFileRules>,
    user_allow: Gitignore,
    user_deny: Gitignore,
    default_deny: Gitignore,
}

impl PatternMatcher {
    /*
     * Builds the matcher for `root`: compiles the user allow/deny lists from the
     * settings and discovers every ignore file beneath the root. Directories that
     * can never contribute (`.git` and default-denied directories) are not
     * descended into while searching.
     */
    pub fn load(root: &Path, settings: &WorkspaceSettings) -> Self {
        let default_deny = build_pattern_set(root, DEFAULT_DENY_PATTERNS.iter().copied());
        let sources = discover_ignore_files(root, &default_deny);
        let matcher = Self::from_sources(root, &sources, settings);
        log::debug!(
            "PatternMatcher: Loaded {} ignore file(s), {} allow and {} deny pattern(s) for {:?}.",
            matcher.ignore_files.len(),
            settings.allow_patterns.len(),
            settings.ignore_patterns.len(),
            root
        );
        matcher
    }

    /*
     * Builds a matcher from an explicit list of ignore files instead of walking
     * the tree.
     */
    pub fn from_sources(root: &Path, sources: &[PathBuf], settings: &WorkspaceSettings) -> Self {
        let mut ignore_files: Vec<IgnoreFileRules> = sources
            .iter()
            .filter_map(|source| {
                let dir = source.parent()?.to_path_buf();
                let (rules, partial_error) = Gitignore::new(source);
                if let Some(e) = partial_error {
                    log::warn!("PatternMatcher: Skipped malformed rule(s) in {source:?}: {e}");
                }
                Some(IgnoreFileRules {
                    dir,
                    source: source.clone(),
                    rules,
                })
            })
            .collect();

        // Deepest directory first; within one directory `.ignore` beats `.gitignore`.
        ignore_files.sort_by(|a, b| {
            b.dir
                .components()
                .count()
                .cmp(&a.dir.components().count())
                .then_with(|| ignore_file_rank(&a.source).cmp(&ignore_file_rank(&b.source)))
        });

        PatternMatcher {
            root: root.to_path_buf(),
            ignore_files,
            user_allow: build_pattern_set(root, settings.allow_patterns.iter().map(String::as_str)),
            user_deny: build_pattern_set(root, settings.ignore_patterns.iter().map(String::as_str)),
            default_deny: build_pattern_set(root, DEFAULT_DENY_PATTERNS.iter().copied()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ignore_file_sources(&self) -> Vec<&Path> {
        self.ignore_files.iter().map(|f| f.source.as_path()).collect()
    }

    /*
     * Decides whether `relative_path` (relative to this matcher's root) is
     * excluded from selection, counting and enumeration. The root itself is
     * never excluded.
     */
    pub fn is_excluded(&self, relative_path: &Path, is_dir: bool) -> bool {
        if relative_path
            .components()
            .any(|c| c.as_os_str() == VCS_DIR_NAME)
        {
            return true;
        }

        let absolute = if relative_path.is_absolute() {
            relative_path.to_path_buf()
        } else {
            self.root.join(relative_path)
        };
        if !absolute.starts_with(&self.root) {
            log::warn!(
                "PatternMatcher: Path {absolute:?} is outside root {:?}; treating as excluded.",
                self.root
            );
            return true;
        }
        if absolute == self.root {
            return false;
        }

        if self
            .user_allow
            .matched_path_or_any_parents(&absolute, is_dir)
            .is_ignore()
        {
            return false;
        }

        // Nothing beneath a directory excluded by an ignore file can be re-included.
        let mut scope = absolute
            .ancestors()
            .skip(1)
            .take_while(|ancestor| *ancestor != self.root.as_path())
            .map(|ancestor| (ancestor, true))
            .chain(std::iter::once((absolute.as_path(), is_dir)));
        if let Some(source) = scope.find_map(|(path, dir)| self.ignoring_file(path, dir)) {
            log::trace!("PatternMatcher: {absolute:?} excluded by {source:?}.");
            return true;
        }

        if self
            .user_deny
            .matched_path_or_any_parents(&absolute, is_dir)
            .is_ignore()
        {
            return true;
        }

        self.default_deny
            .matched_path_or_any_parents(&absolute, is_dir)
            .is_ignore()
    }

    /*
     * Evaluates the ignore files covering `absolute`, deepest first, and
     * returns the source of the file that ignores it. A whitelist match ends
     * the evaluation.
     */
    fn ignoring_file(&self, absolute: &Path, is_dir: bool) -> Option<&Path> {
        for ignore_file in &self.ignore_files {
            if absolute == ignore_file.dir || !absolute.starts_with(&ignore_file.dir) {
                continue;
            }
            let matched = ignore_file
                .rules
                .matched_path_or_any_parents(absolute, is_dir);
            if matched.is_ignore() {
                return Some(&ignore_file.source);
            }
            if matched.is_whitelist() {
                return None;
            }
        }
        None
    }
}

fn ignore_file_rank(source: &Path) -> usize {
    source
        .file_name()
        .and_then(OsStr::to_str)
        .and_then(|name| IGNORE_FILE_NAMES.iter().position(|n| *n == name))
        .unwrap_or(IGNORE_FILE_NAMES.len())
}

/*
 * Compiles gitignore-style lines anchored at `root`. Blank lines and comments
 * are skipped by the builder; an invalid line is logged and dropped.
 */
fn build_pattern_set<'a>(root: &Path, patterns: impl Iterator<Item = &'a str>) -> Gitignore {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in patterns {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Err(e) = builder.add_line(None, trimmed) {
            log::warn!("PatternMatcher: Invalid pattern '{pattern}' skipped: {e}");
        }
    }
    match builder.build() {
        Ok(set) => set,
        Err(e) => {
            log::warn!("PatternMatcher: Failed to build pattern set for {root:?}: {e}");
            Gitignore::empty()
        }
    }
}

fn discover_ignore_files(root: &Path, default_deny: &Gitignore) -> Vec<PathBuf> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if !entry.file_type().is_dir() || entry.path() == root {
                return true;
            }
            entry.file_name() != VCS_DIR_NAME
                && !default_deny
                    .matched_path_or_any_parents(entry.path(), true)
                    .is_ignore()
        });

    let mut sources = Vec::new();
    for entry_result in walker {
        match entry_result {
            Ok(entry) => {
                if entry.file_type().is_file() && is_ignore_file(entry.path()) {
                    sources.push(entry.into_path());
                }
            }
            Err(e) => {
                log::warn!("PatternMatcher: Error while searching ignore files under {root:?}: {e}");
            }
        }
    }
    sources
}

/*
 * One `PatternMatcher` per workspace root.
 */
#[derive(Default)]
pub struct PatternRegistry {
    matchers: HashMap<PathBuf, PatternMatcher>,
}

impl PatternRegistry {
    pub fn load(roots: &[PathBuf], settings: &WorkspaceSettings) -> Self {
        let matchers = roots
            .iter()
            .map(|root| (root.clone(), PatternMatcher::load(root, settings)))
            .collect();
        PatternRegistry { matchers }
    }

    pub fn reload_root(&mut self, root: &Path, settings: &WorkspaceSettings) {
        self.matchers
            .insert(root.to_path_buf(), PatternMatcher::load(root, settings));
    }

    pub fn matcher_for(&self, root: &Path) -> Option<&PatternMatcher> {
        self.matchers.get(root)
    }

    /*
     * Exclusion check for an absolute path owned by `root`. A root without a
     * matcher only applies the always-on `.git` rule.
     */
    pub fn is_excluded(&self, root: &Path, absolute_path: &Path, is_dir: bool) -> bool {
        let Ok(relative) = absolute_path.strip_prefix(root) else {
            return true;
        };
        match self.matchers.get(root) {
            Some(matcher) => matcher.is_excluded(relative, is_dir),
            None => relative
                .components()
                .any(|c| c.as_os_str() == VCS_DIR_NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::{self, Write};
    use tempfile::tempdir;

    fn create_gitignore(dir_path: &Path, content: &str) -> io::Result<()> {
        let mut file = File::create(dir_path.join(".gitignore"))?;
        writeln!(file, "{content}")?;
        Ok(())
    }

    fn setup_test_dir_for_ignore(base_path: &Path) -> io::Result<()> {
        fs::create_dir_all(base_path.join(".git"))?;
        fs::create_dir_all(base_path.join("src").join("sub_src"))?;
        fs::create_dir_all(base_path.join("target"))?;
        fs::create_dir_all(base_path.join("logs"))?;
        fs::create_dir_all(base_path.join("data").join("sensitive"))?;
        fs::create_dir_all(base_path.join("sensitive"))?;
        fs::create_dir_all(base_path.join("node_modules").join("pkg"))?;
        // An ignore file inside a default-denied directory must not be picked up.
        create_gitignore(&base_path.join("node_modules").join("pkg"), "*")?;

        create_gitignore(base_path, "target/\n*.tmp\nlogs/*\n!logs/trace.log\n")?;
        create_gitignore(&base_path.join("data"), "sensitive/\n")?;
        Ok(())
    }

    fn rel(path: &str) -> PathBuf {
        PathBuf::from(path)
    }

    #[test]
    fn test_ignore_rules_are_anchored_to_their_directory() -> io::Result<()> {
        // Arrange
        let dir = tempdir()?;
        setup_test_dir_for_ignore(dir.path())?;

        // Act
        let matcher = PatternMatcher::load(dir.path(), &WorkspaceSettings::default());

        // Assert
        assert_eq!(matcher.ignore_file_sources().len(), 2);
        assert!(matcher.is_excluded(&rel("target"), true));
        assert!(matcher.is_excluded(&rel("target/debug/out.bin"), false));
        assert!(matcher.is_excluded(&rel("src/sub_src/temp.tmp"), false));
        assert!(!matcher.is_excluded(&rel("src/sub_src/deep.rs"), false));
        assert!(matcher.is_excluded(&rel("logs/app.log"), false));
        assert!(!matcher.is_excluded(&rel("logs/trace.log"), false));
        assert!(matcher.is_excluded(&rel("data/sensitive"), true));
        assert!(matcher.is_excluded(&rel("data/sensitive/secret.key"), false));
        assert!(!matcher.is_excluded(&rel("data/config.json"), false));
        assert!(
            !matcher.is_excluded(&rel("sensitive"), true),
            "data/.gitignore must not apply outside data/"
        );
        Ok(())
    }

    #[test]
    fn test_git_directory_and_default_patterns_are_always_excluded() -> io::Result<()> {
        let dir = tempdir()?;
        setup_test_dir_for_ignore(dir.path())?;

        let matcher = PatternMatcher::load(dir.path(), &WorkspaceSettings::default());

        assert!(matcher.is_excluded(&rel(".git"), true));
        assert!(matcher.is_excluded(&rel(".git/config"), false));
        assert!(matcher.is_excluded(&rel("node_modules"), true));
        assert!(matcher.is_excluded(&rel("src/cache.pyc"), false));
        assert!(!matcher.is_excluded(&rel(""), true), "The root is never excluded");
        Ok(())
    }

    #[test]
    fn test_allow_patterns_override_ignore_rules() -> io::Result<()> {
        // Arrange
        let dir = tempdir()?;
        setup_test_dir_for_ignore(dir.path())?;
        let settings = WorkspaceSettings {
            allow_patterns: vec!["*.tmp".to_string()],
            ..WorkspaceSettings::default()
        };

        // Act
        let matcher = PatternMatcher::load(dir.path(), &settings);

        // Assert
        assert!(!matcher.is_excluded(&rel("src/sub_src/temp.tmp"), false));
        assert!(matcher.is_excluded(&rel(".git/x.tmp"), false), ".git wins over allow");
        Ok(())
    }

    #[test]
    fn test_user_deny_patterns_and_malformed_patterns() -> io::Result<()> {
        // Arrange
        let dir = tempdir()?;
        let settings = WorkspaceSettings {
            ignore_patterns: vec![
                "*.log".to_string(),
                "a[".to_string(),
                "build/".to_string(),
                "   ".to_string(),
            ],
            ..WorkspaceSettings::default()
        };

        // Act
        let matcher = PatternMatcher::load(dir.path(), &settings);

        // Assert
        assert!(matcher.is_excluded(&rel("src/debug.log"), false));
        assert!(matcher.is_excluded(&rel("build/out.o"), false));
        assert!(!matcher.is_excluded(&rel("src/main.rs"), false));
        Ok(())
    }

    #[test]
    fn test_deeper_ignore_file_can_reinclude() -> io::Result<()> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("docs"))?;
        create_gitignore(dir.path(), "*.md")?;
        create_gitignore(&dir.path().join("docs"), "!*.md")?;

        let matcher = PatternMatcher::load(dir.path(), &WorkspaceSettings::default());

        assert!(matcher.is_excluded(&rel("README.md"), false));
        assert!(!matcher.is_excluded(&rel("docs/guide.md"), false));
        Ok(())
    }

    #[test]
    fn test_whitelist_cannot_reinclude_inside_ignored_directory() -> io::Result<()> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("vendor").join("lib"))?;
        create_gitignore(dir.path(), "vendor/")?;
        create_gitignore(&dir.path().join("vendor"), "!*.rs")?;
        create_gitignore(&dir.path().join("vendor").join("lib"), "!*.rs")?;

        let matcher = PatternMatcher::load(dir.path(), &WorkspaceSettings::default());

        assert!(matcher.is_excluded(&rel("vendor"), true));
        assert!(matcher.is_excluded(&rel("vendor/keep.rs"), false));
        assert!(matcher.is_excluded(&rel("vendor/lib/deep.rs"), false));
        Ok(())
    }

    #[test]
    fn test_is_ignore_file() {
        assert!(is_ignore_file(Path::new("/ws/src/.gitignore")));
        assert!(is_ignore_file(Path::new("/ws/.ignore")));
        assert!(!is_ignore_file(Path::new("/ws/gitignore.txt")));
    }

    #[test]
    fn test_registry_rejects_paths_outside_root() -> io::Result<()> {
        let dir = tempdir()?;
        let root = dir.path().to_path_buf();
        let registry = PatternRegistry::load(&[root.clone()], &WorkspaceSettings::default());

        assert!(!registry.is_excluded(&root, &root.join("a.rs"), false));
        assert!(registry.is_excluded(&root, Path::new("/elsewhere/a.rs"), false));
        assert!(registry.matcher_for(&root).is_some());
        Ok(())
    }
}
