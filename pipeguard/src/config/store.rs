//! Hot-reloading holder for the active configuration.

use super::model::CoordinatorConfig;
use super::validation::validate_config;
use crate::cancellation::ShutdownToken;
use crate::errors::ConfigError;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

/// Result of a reload check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The file has not changed since the last load.
    Unchanged,
    /// A new configuration was parsed, validated and swapped in.
    Reloaded,
    /// The changed file was rejected; the previous config stays active.
    Rejected(String),
    /// The store was not created from a file.
    NoSource,
}

/// Parses and validates a configuration from TOML text.
pub fn parse_config(source: &str) -> Result<CoordinatorConfig, ConfigError> {
    let config: CoordinatorConfig =
        toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Reads, parses and validates a configuration file.
pub fn load_config(path: &Path) -> Result<CoordinatorConfig, ConfigError> {
    let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&source)
}

/// Holds the active [`CoordinatorConfig`].
///
/// Readers get an `Arc` snapshot; a reload replaces the whole config, so a
/// reader never sees a partially applied change.
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<CoordinatorConfig>>,
    path: Option<PathBuf>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    /// Loads the config file at `path`. Fails if it is missing or invalid.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let modified = modified_time(&path);
        let config = load_config(&path)?;
        info!(
            path = %path.display(),
            workflows = config.workflows.len(),
            "configuration loaded"
        );

        Ok(Self {
            current: RwLock::new(Arc::new(config)),
            path: Some(path),
            last_modified: Mutex::new(modified),
        })
    }

    /// Wraps an in-memory configuration. Validation still applies.
    pub fn from_config(config: CoordinatorConfig) -> Result<Self, ConfigError> {
        validate_config(&config)?;
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
            path: None,
            last_modified: Mutex::new(None),
        })
    }

    /// Returns a snapshot of the active configuration.
    #[must_use]
    pub fn current(&self) -> Arc<CoordinatorConfig> {
        Arc::clone(&self.current.read())
    }

    /// Returns the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replaces the active configuration after validating it.
    pub fn replace(&self, config: CoordinatorConfig) -> Result<(), ConfigError> {
        validate_config(&config)?;
        *self.current.write() = Arc::new(config);
        Ok(())
    }

    /// Reloads the file if its modification time changed.
    pub fn reload_if_changed(&self) -> ReloadOutcome {
        let Some(path) = self.path.as_deref() else {
            return ReloadOutcome::NoSource;
        };

        let modified = modified_time(path);
        {
            let mut last = self.last_modified.lock();
            if modified.is_some() && *last == modified {
                return ReloadOutcome::Unchanged;
            }
            // Record the attempt so a broken file is reported once per edit.
            *last = modified;
        }

        match load_config(path) {
            Ok(config) => {
                let workflows = config.workflows.len();
                *self.current.write() = Arc::new(config);
                info!(path = %path.display(), workflows, "configuration reloaded");
                ReloadOutcome::Reloaded
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "configuration reload rejected, keeping previous config"
                );
                ReloadOutcome::Rejected(e.to_string())
            }
        }
    }

    /// Spawns a task polling the file every `interval` until shutdown.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: ShutdownToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.wait() => {
                        debug!("config watcher stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        let _ = store.reload_if_changed();
                    }
                }
            }
        })
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID: &str = r#"
        [scheduler]
        utc_offset_minutes = -300

        [triggers]
        raw_complete = ["analytics"]

        [[workflows]]
        id = "morning_ops"
        decision = { type = "fixed_window", start_hour = 6, window_hours = 2 }
        tasks = [{ job = "events" }, { job = "features", after = ["events"] }]
    "#;

    fn write_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn rewrite(file: &NamedTempFile, contents: &str) {
        std::fs::write(file.path(), contents).unwrap();
        // Bump mtime explicitly; some filesystems have coarse timestamps.
        let later = SystemTime::now() + Duration::from_secs(5);
        let handle = std::fs::File::options().write(true).open(file.path()).unwrap();
        handle.set_modified(later).unwrap();
    }

    #[test]
    fn test_parse_config() {
        let config = parse_config(VALID).unwrap();
        assert_eq!(config.scheduler.utc_offset_minutes, -300);
        assert_eq!(config.workflows.len(), 1);
        assert_eq!(config.processors_for("raw_complete"), ["analytics".to_string()]);
        assert_eq!(config.gate.bootstrap_days, 14);
    }

    #[test]
    fn test_parse_rejects_unknown_field() {
        let err = parse_config("[scheduler]\nbogus = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConfigStore::load("/nonexistent/pipeguard.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_reload_unchanged() {
        let file = write_file(VALID);
        let store = ConfigStore::load(file.path()).unwrap();
        assert_eq!(store.reload_if_changed(), ReloadOutcome::Unchanged);
    }

    #[test]
    fn test_reload_swaps_config() {
        let file = write_file(VALID);
        let store = ConfigStore::load(file.path()).unwrap();
        let before = store.current();

        rewrite(&file, &VALID.replace("-300", "60"));
        assert_eq!(store.reload_if_changed(), ReloadOutcome::Reloaded);

        assert_eq!(before.scheduler.utc_offset_minutes, -300);
        assert_eq!(store.current().scheduler.utc_offset_minutes, 60);
    }

    #[test]
    fn test_reload_invalid_keeps_previous() {
        let file = write_file(VALID);
        let store = ConfigStore::load(file.path()).unwrap();

        rewrite(&file, &VALID.replace("start_hour = 6", "start_hour = 30"));
        let outcome = store.reload_if_changed();
        assert!(matches!(outcome, ReloadOutcome::Rejected(_)));
        assert_eq!(store.current().scheduler.utc_offset_minutes, -300);
    }

    #[test]
    fn test_from_config_no_source() {
        let store = ConfigStore::from_config(CoordinatorConfig::default()).unwrap();
        assert_eq!(store.reload_if_changed(), ReloadOutcome::NoSource);
        assert!(store.path().is_none());
    }

    #[tokio::test]
    async fn test_watcher_stops_on_shutdown() {
        let file = write_file(VALID);
        let store = Arc::new(ConfigStore::load(file.path()).unwrap());
        let shutdown = ShutdownToken::new();

        let handle = store.spawn_watcher(Duration::from_millis(5), shutdown.clone());
        shutdown.shutdown("test");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
