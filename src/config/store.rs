//! Configuration store
//!
//! Loads the YAML configuration file and publishes it as a lock-free
//! snapshot. Hot reload swaps the snapshot and lets supervisors reconcile
//! against the new value; there is no partial in-place mutation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::schema::AppConfig;
use crate::error::{AppError, Result};

pub struct ConfigStore {
    path: PathBuf,
    current: ArcSwap<AppConfig>,
}

impl ConfigStore {
    /// Load the configuration file, falling back to defaults when absent
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = Self::read_file(&path)?;
        Ok(Self {
            path,
            current: ArcSwap::from_pointee(config),
        })
    }

    fn read_file(path: &Path) -> Result<AppConfig> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&raw)
                .map_err(|e| AppError::ConfigInvalid(format!("{}: {}", path.display(), e)))?
        } else {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            AppConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Current configuration snapshot
    pub fn get(&self) -> Arc<AppConfig> {
        self.current.load_full()
    }

    /// Re-read the file, validate and swap the snapshot
    ///
    /// On any error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<Arc<AppConfig>> {
        let config = Self::read_file(&self.path)?;
        let config = Arc::new(config);
        self.current.store(config.clone());
        tracing::info!("Configuration reloaded from {}", self.path.display());
        Ok(config)
    }

    /// Replace the snapshot directly (tests and CLI overrides)
    pub fn set(&self, config: AppConfig) {
        self.current.store(Arc::new(config));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("absent.yaml")).unwrap();
        assert!(store.get().cameras.is_empty());
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "web:\n  port: 8080\n").unwrap();

        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.get().web.port, 8080);

        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "web:\n  port: 9090").unwrap();
        let reloaded = store.reload().unwrap();
        assert_eq!(reloaded.web.port, 9090);
        assert_eq!(store.get().web.port, 9090);
    }

    #[test]
    fn test_invalid_reload_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "web:\n  port: 8080\n").unwrap();
        let store = ConfigStore::load(&path).unwrap();

        std::fs::write(&path, "mode:\n  default: nonsense\n").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.get().web.port, 8080);
    }
}
