//! Centralized configuration for the pretrained artifact service.
//!
//! This module provides configuration constants for network operations and
//! on-disk layout, the runtime [`Settings`] loaded from file and environment,
//! and the process-wide [`ConfigStore`] holding the cache root.

use crate::error::{PretrainedError, Result};
use crate::store::atomic_write_json;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const USER_AGENT: &'static str = concat!("pretrained/", env!("CARGO_PKG_VERSION"));
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    pub const REGISTRY_INDEX_TTL: Duration = Duration::from_secs(300);
}

/// Download retry policy defaults.
pub struct RetryDefaults;

impl RetryDefaults {
    pub const MAX_ATTEMPTS: u32 = 5;
    pub const BASE_DELAY: Duration = Duration::from_millis(500);
    pub const EXPONENTIAL_BASE: f64 = 2.0;
    pub const MAX_DELAY: Duration = Duration::from_secs(30);
    /// Jitter as a fraction of the computed delay (0.2 = ±20%).
    pub const JITTER_RATIO: f64 = 0.2;
}

/// Shared directory and path configurations.
pub struct PathsConfig;

impl PathsConfig {
    pub const DEFAULT_CACHE_DIR_NAME: &'static str = "pretrained";
    pub const INDEX_FILE_NAME: &'static str = "index";
    pub const INDEX_LOCK_FILE_NAME: &'static str = "index.lock";
    pub const ARTIFACT_FILE_NAME: &'static str = "artifact";
    pub const PARTIAL_SUFFIX: &'static str = ".part";
    pub const ARTIFACT_LOCK_FILE_NAME: &'static str = ".lock";
    pub const SETTINGS_FILE_NAME: &'static str = "settings.json";
}

/// Environment variables consulted by [`Settings::from_env`].
pub struct EnvConfig;

impl EnvConfig {
    pub const CACHE_ROOT: &'static str = "PRETRAINED_CACHE_ROOT";
    pub const REGISTRY_URL: &'static str = "PRETRAINED_REGISTRY_URL";
}

/// Runtime settings, loadable from a JSON file.
///
/// Every field is optional; absent values fall back to the constants above.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Root directory of the artifact cache.
    pub cache_root: Option<PathBuf>,
    /// URL of the registry index document.
    pub registry_url: Option<String>,
    /// Maximum download attempts (including the first one).
    pub max_attempts: Option<u32>,
    /// Base retry delay in milliseconds.
    pub base_delay_ms: Option<u64>,
    /// Request timeout for registry queries in seconds.
    pub request_timeout_secs: Option<u64>,
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PretrainedError::disk("Failed to read settings", path, e))?;
        let settings: Settings = serde_json::from_str(&contents).map_err(|e| {
            PretrainedError::Config {
                message: format!("Failed to parse settings {}: {}", path.display(), e),
            }
        })?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load settings from `path`, or defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write settings to a JSON file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Validate `root` and record it as the cache root in the settings file
    /// at `path`, keeping the file's other fields.
    pub fn persist_cache_root(path: &Path, root: &Path) -> Result<Self> {
        validate_cache_root(root)?;
        let mut settings = Self::load_or_default(path)?;
        settings.cache_root = Some(root.to_path_buf());
        settings.save(path)?;
        info!("Cache root {} saved to {}", root.display(), path.display());
        Ok(settings)
    }

    /// Settings taken from the environment only.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment variable overrides on top of these settings.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(root) = std::env::var_os(EnvConfig::CACHE_ROOT) {
            if !root.is_empty() {
                self.cache_root = Some(PathBuf::from(root));
            }
        }
        if let Ok(url) = std::env::var(EnvConfig::REGISTRY_URL) {
            if !url.is_empty() {
                self.registry_url = Some(url);
            }
        }
        self
    }

    /// Cache root from settings, falling back to the platform cache directory.
    pub fn resolved_cache_root(&self) -> PathBuf {
        self.cache_root.clone().unwrap_or_else(default_cache_root)
    }

    /// Request timeout for registry queries.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(NetworkConfig::REQUEST_TIMEOUT)
    }
}

/// Platform default settings file: `<config dir>/pretrained/settings.json`.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| {
        dir.join(PathsConfig::DEFAULT_CACHE_DIR_NAME)
            .join(PathsConfig::SETTINGS_FILE_NAME)
    })
}

/// Platform default cache root: `<cache dir>/pretrained`.
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(PathsConfig::DEFAULT_CACHE_DIR_NAME)
}

/// Process-wide configuration of the cache root.
///
/// The configured root is stable until explicitly changed with [`set`] or
/// [`reset`]. Changes only affect store handles opened afterwards.
///
/// [`set`]: ConfigStore::set
/// [`reset`]: ConfigStore::reset
#[derive(Debug)]
pub struct ConfigStore {
    default_root: PathBuf,
    cache_root: RwLock<PathBuf>,
}

static GLOBAL_CONFIG: OnceLock<Arc<ConfigStore>> = OnceLock::new();

impl ConfigStore {
    /// Create a config store whose initial and reset value is `default_root`.
    pub fn new(default_root: impl Into<PathBuf>) -> Self {
        let default_root = default_root.into();
        Self {
            cache_root: RwLock::new(default_root.clone()),
            default_root,
        }
    }

    /// Create a config store from runtime settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.resolved_cache_root())
    }

    /// The process-wide instance, initialized from the environment on first use.
    pub fn global() -> Arc<ConfigStore> {
        GLOBAL_CONFIG
            .get_or_init(|| {
                let store = ConfigStore::from_settings(&Settings::from_env());
                info!("Cache root: {}", store.get().display());
                Arc::new(store)
            })
            .clone()
    }

    /// Get the current cache root.
    pub fn get(&self) -> PathBuf {
        match self.cache_root.read() {
            Ok(root) => root.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Set the cache root.
    ///
    /// The directory is created if missing and checked for writability.
    /// Fails with `InvalidPath` if it cannot be created or written.
    pub fn set(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        validate_cache_root(path)?;

        let mut root = self.cache_root.write().map_err(|_| PretrainedError::Config {
            message: "Cache root lock poisoned".to_string(),
        })?;
        if *root != path {
            info!("Cache root changed: {} -> {}", root.display(), path.display());
        }
        *root = path.to_path_buf();
        Ok(())
    }

    /// Restore the cache root to its initial value.
    pub fn reset(&self) {
        match self.cache_root.write() {
            Ok(mut root) => *root = self.default_root.clone(),
            Err(poisoned) => *poisoned.into_inner() = self.default_root.clone(),
        }
    }
}

/// Check that `path` is a creatable, writable directory.
fn validate_cache_root(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(PretrainedError::InvalidPath {
            path: path.to_path_buf(),
            message: "path is empty".to_string(),
        });
    }

    if path.exists() && !path.is_dir() {
        return Err(PretrainedError::InvalidPath {
            path: path.to_path_buf(),
            message: "path exists and is not a directory".to_string(),
        });
    }

    std::fs::create_dir_all(path).map_err(|e| PretrainedError::InvalidPath {
        path: path.to_path_buf(),
        message: format!("cannot create directory: {}", e),
    })?;

    // Check writability; the scratch file is removed on drop.
    match tempfile::NamedTempFile::new_in(path) {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("Cache root {} is not writable: {}", path.display(), e);
            Err(PretrainedError::InvalidPath {
                path: path.to_path_buf(),
                message: format!("directory is not writable: {}", e),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_get_returns_default_until_set() {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigStore::new(temp_dir.path().join("default"));
        assert_eq!(store.get(), temp_dir.path().join("default"));

        let custom = temp_dir.path().join("custom");
        store.set(&custom).unwrap();
        assert_eq!(store.get(), custom);
        assert!(custom.is_dir());
    }

    #[test]
    fn test_reset_restores_default() {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigStore::new(temp_dir.path().join("default"));
        store.set(temp_dir.path().join("other")).unwrap();
        store.reset();
        assert_eq!(store.get(), temp_dir.path().join("default"));
    }

    #[test]
    fn test_set_rejects_file_path() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let store = ConfigStore::new(temp_dir.path());
        let err = store.set(&file).unwrap_err();
        assert!(matches!(err, PretrainedError::InvalidPath { .. }));
        assert_eq!(store.get(), temp_dir.path());
    }

    #[test]
    fn test_set_rejects_empty_path() {
        let store = ConfigStore::new("/tmp");
        assert!(matches!(
            store.set("").unwrap_err(),
            PretrainedError::InvalidPath { .. }
        ));
    }

    #[test]
    fn test_settings_load_and_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"cache_root": "/data/pretrained", "registry_url": "https://registry.example.com/index.json"}"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.cache_root, Some(PathBuf::from("/data/pretrained")));
        assert_eq!(
            settings.registry_url.as_deref(),
            Some("https://registry.example.com/index.json")
        );
        assert_eq!(settings.max_attempts, None);
        assert_eq!(settings.request_timeout(), NetworkConfig::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_settings_load_rejects_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load(&path).unwrap_err(),
            PretrainedError::Config { .. }
        ));
    }

    #[test]
    fn test_persist_cache_root_keeps_other_fields() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf").join("settings.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"registry_url": "https://registry.example.com/index.json"}"#)
            .unwrap();

        let root = temp_dir.path().join("models");
        Settings::persist_cache_root(&path, &root).unwrap();

        let reloaded = Settings::load(&path).unwrap();
        assert_eq!(reloaded.cache_root, Some(root.clone()));
        assert_eq!(
            reloaded.registry_url.as_deref(),
            Some("https://registry.example.com/index.json")
        );
        assert_eq!(reloaded.resolved_cache_root(), root);
    }

    #[test]
    fn test_persist_cache_root_creates_file_and_rejects_bad_root() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");

        let not_a_dir = temp_dir.path().join("file");
        std::fs::write(&not_a_dir, b"x").unwrap();
        assert!(matches!(
            Settings::persist_cache_root(&path, &not_a_dir).unwrap_err(),
            PretrainedError::InvalidPath { .. }
        ));
        assert!(!path.exists());

        let root = temp_dir.path().join("cache");
        Settings::persist_cache_root(&path, &root).unwrap();
        assert_eq!(Settings::load_or_default(&path).unwrap().cache_root, Some(root));
    }

    #[test]
    fn test_default_cache_root_name() {
        assert!(default_cache_root().ends_with(PathsConfig::DEFAULT_CACHE_DIR_NAME));
    }

    #[test]
    fn test_retry_defaults() {
        assert_eq!(RetryDefaults::MAX_ATTEMPTS, 5);
        assert_eq!(RetryDefaults::BASE_DELAY, Duration::from_millis(500));
        assert!(RetryDefaults::JITTER_RATIO > 0.0 && RetryDefaults::JITTER_RATIO < 1.0);
    }
}
