/*
 * Manages the engine's read-only configuration: user ignore and allow
 * patterns, the auto-check-new-files flag, the clear-all behaviour and the
 * token estimator. Settings are persisted as JSON in the application's local
 * configuration directory.
 *
 * It uses a trait-based approach (`ConfigManagerOperations`) so the session
 * can be handed settings from any host, and tests can use a temporary
 * directory. A missing settings file is not an error: defaults are returned.
 */
use crate::core::path_utils;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const SETTINGS_FILENAME: &str = "settings.json";

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Serde(serde_json::Error),
    NoProjectDirectory,
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Serde(err)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Configuration I/O error: {e}"),
            ConfigError::Serde(e) => write!(f, "Configuration format error: {e}"),
            ConfigError::NoProjectDirectory => {
                write!(f, "Could not determine project directory for configuration")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Serde(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/*
 * Policy for "clear all checks". `PreserveOpenEditors` keeps checks on files
 * currently open in an editor and offers, once per session, to clear those too.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearBehavior {
    #[default]
    ClearAll,
    PreserveOpenEditors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEstimatorKind {
    #[default]
    ByteRatio,
    Cl100k,
}

/*
 * User-facing settings. Every field has a default so that older or partial
 * settings files still load.
 */
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    pub ignore_patterns: Vec<String>,
    pub allow_patterns: Vec<String>,
    pub auto_check_new_files: bool,
    pub clear_behavior: ClearBehavior,
    pub token_estimator: TokenEstimatorKind,
}

impl WorkspaceSettings {
    /*
     * True when switching from `self` to `other` changes which paths are
     * excluded, i.e. every cached aggregate becomes suspect.
     */
    pub fn exclusion_rules_differ(&self, other: &WorkspaceSettings) -> bool {
        self.ignore_patterns != other.ignore_patterns || self.allow_patterns != other.allow_patterns
    }
}

pub trait ConfigManagerOperations: Send + Sync {
    fn load_settings(&self) -> Result<WorkspaceSettings>;
    fn save_settings(&self, settings: &WorkspaceSettings) -> Result<()>;
}

/*
 * Stores `settings.json` in a fixed directory. `for_app` resolves the platform
 * local configuration directory of the application; `with_directory` pins an
 * explicit directory (used by tests and by hosts with their own layout).
 */
pub struct CoreConfigManager {
    config_dir: PathBuf,
}

impl CoreConfigManager {
    pub fn for_app(app_name: &str) -> Result<Self> {
        let config_dir = path_utils::get_base_app_config_local_dir(app_name)
            .ok_or(ConfigError::NoProjectDirectory)?;
        Ok(CoreConfigManager { config_dir })
    }

    pub fn with_directory(config_dir: PathBuf) -> Self {
        CoreConfigManager { config_dir }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILENAME)
    }

    fn ensure_config_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            log::debug!("CoreConfigManager: Created configuration directory {dir:?}.");
        }
        Ok(())
    }
}

impl ConfigManagerOperations for CoreConfigManager {
    fn load_settings(&self) -> Result<WorkspaceSettings> {
        let file_path = self.settings_path();
        log::trace!("CoreConfigManager: Loading settings from {file_path:?}");
        if !file_path.exists() {
            log::debug!("CoreConfigManager: Settings file {file_path:?} does not exist, using defaults.");
            return Ok(WorkspaceSettings::default());
        }

        let reader = BufReader::new(File::open(&file_path)?);
        let settings: WorkspaceSettings = serde_json::from_reader(reader)?;
        log::debug!(
            "CoreConfigManager: Loaded settings from {file_path:?} ({} ignore, {} allow patterns).",
            settings.ignore_patterns.len(),
            settings.allow_patterns.len()
        );
        Ok(settings)
    }

    fn save_settings(&self, settings: &WorkspaceSettings) -> Result<()> {
        Self::ensure_config_dir(&self.config_dir)?;
        let file_path = self.settings_path();
        let mut writer = BufWriter::new(File::create(&file_path)?);
        serde_json::to_writer_pretty(&mut writer, settings)?;
        writer.flush()?;
        log::debug!("CoreConfigManager: Saved settings to {file_path:?}.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_settings_missing_file_returns_defaults() {
        // Arrange
        let dir = tempdir().unwrap();
        let manager = CoreConfigManager::with_directory(dir.path().to_path_buf());

        // Act
        let settings = manager.load_settings().unwrap();

        // Assert
        assert_eq!(settings, WorkspaceSettings::default());
        assert_eq!(settings.clear_behavior, ClearBehavior::ClearAll);
        assert_eq!(settings.token_estimator, TokenEstimatorKind::ByteRatio);
        assert!(!settings.auto_check_new_files);
    }

    #[test]
    fn test_save_and_load_settings() {
        // Arrange
        let dir = tempdir().unwrap();
        let manager = CoreConfigManager::with_directory(dir.path().join("nested"));
        let settings = WorkspaceSettings {
            ignore_patterns: vec!["*.log".to_string()],
            allow_patterns: vec!["keep.log".to_string()],
            auto_check_new_files: true,
            clear_behavior: ClearBehavior::PreserveOpenEditors,
            token_estimator: TokenEstimatorKind::Cl100k,
        };

        // Act
        manager.save_settings(&settings).unwrap();
        let loaded = manager.load_settings().unwrap();

        // Assert
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_load_settings_accepts_partial_document() {
        let dir = tempdir().unwrap();
        let manager = CoreConfigManager::with_directory(dir.path().to_path_buf());
        fs::write(
            manager.settings_path(),
            r#"{ "auto_check_new_files": true, "clear_behavior": "preserve_open_editors" }"#,
        )
        .unwrap();

        let loaded = manager.load_settings().unwrap();

        assert!(loaded.auto_check_new_files);
        assert_eq!(loaded.clear_behavior, ClearBehavior::PreserveOpenEditors);
        assert!(loaded.ignore_patterns.is_empty());
    }

    #[test]
    fn test_load_settings_reports_malformed_json() {
        let dir = tempdir().unwrap();
        let manager = CoreConfigManager::with_directory(dir.path().to_path_buf());
        fs::write(manager.settings_path(), "{ not json").unwrap();

        let result = manager.load_settings();

        assert!(matches!(result, Err(ConfigError::Serde(_))));
    }

    #[test]
    fn test_exclusion_rules_differ() {
        let base = WorkspaceSettings::default();
        let mut other = base.clone();
        other.auto_check_new_files = true;
        assert!(!base.exclusion_rules_differ(&other));
        other.allow_patterns.push("x".to_string());
        assert!(base.exclusion_rules_differ(&other));
    }
}
