//! Engine configuration, loaded from YAML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Per-entry limit inside a sweep unless configured otherwise.
pub const DEFAULT_SWEEP_ENTRY_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory of the scenario store.
    pub workspace_root: PathBuf,
    /// TTL applied when a build request does not carry one.
    pub default_ttl_hours: i64,
    /// Worker threads used by sweeps.
    pub sweep_workers: usize,
    /// Per-entry limit inside a sweep; `null` disables it.
    pub sweep_entry_timeout_ms: Option<u64>,
    /// Limit on a single build hook invocation.
    pub max_build_duration_ms: Option<u64>,
    /// Let `run_simulation` use scenarios past their expiry.
    pub allow_expired_runs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(".scenflow"),
            default_ttl_hours: sf_store::lifecycle::DEFAULT_TTL_HOURS,
            sweep_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            sweep_entry_timeout_ms: Some(DEFAULT_SWEEP_ENTRY_TIMEOUT_MS),
            max_build_duration_ms: None,
            allow_expired_runs: false,
        }
    }
}

impl EngineConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: root.into(),
            ..Self::default()
        }
    }

    pub fn load_yaml(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_yaml(&self, path: &Path) -> EngineResult<()> {
        self.validate()?;
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.sweep_workers == 0 {
            return Err(EngineError::Config(
                "sweep_workers must be at least 1".to_string(),
            ));
        }
        if self.sweep_entry_timeout_ms == Some(0) {
            return Err(EngineError::Config(
                "sweep_entry_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_build_duration_ms == Some(0) {
            return Err(EngineError::Config(
                "max_build_duration_ms must be positive".to_string(),
            ));
        }
        if self.workspace_root.as_os_str().is_empty() {
            return Err(EngineError::Config(
                "workspace_root must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sweep_entry_timeout(&self) -> Option<Duration> {
        self.sweep_entry_timeout_ms.map(Duration::from_millis)
    }

    pub fn max_build_duration(&self) -> Option<Duration> {
        self.max_build_duration_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: EngineConfig =
            serde_yaml::from_str("workspace_root: /tmp/sf\nsweep_workers: 3\n").unwrap();
        assert_eq!(config.workspace_root, PathBuf::from("/tmp/sf"));
        assert_eq!(config.sweep_workers, 3);
        assert_eq!(config.default_ttl_hours, 24);
        assert!(!config.allow_expired_runs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers_and_timeouts() {
        let mut config = EngineConfig::with_root("/tmp/sf");
        config.sweep_workers = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::with_root("/tmp/sf");
        config.sweep_entry_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn timeouts_as_durations() {
        let config = EngineConfig {
            max_build_duration_ms: Some(1500),
            ..EngineConfig::with_root("x")
        };
        assert_eq!(config.max_build_duration(), Some(Duration::from_millis(1500)));
        assert_eq!(
            config.sweep_entry_timeout(),
            Some(Duration::from_millis(DEFAULT_SWEEP_ENTRY_TIMEOUT_MS))
        );
    }

    #[test]
    fn sweep_entries_are_bounded_by_default() {
        assert_eq!(
            EngineConfig::default().sweep_entry_timeout(),
            Some(Duration::from_secs(30))
        );
        let config: EngineConfig =
            serde_yaml::from_str("workspace_root: /tmp/sf\nsweep_entry_timeout_ms: null\n").unwrap();
        assert_eq!(config.sweep_entry_timeout(), None);
    }
}
