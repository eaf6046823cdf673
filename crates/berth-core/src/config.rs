//! Engine configuration.
//!
//! Every filesystem location the engine touches is derived from
//! [`BerthConfig::root`] and handed to components at construction time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{BerthError, Result};

/// Health-gate retry policy applied after every pointer swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthGatePolicy {
    /// Probe attempts before the deploy is rolled back.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub interval_ms: u64,
    /// Hard timeout for a single probe.
    pub timeout_ms: u64,
}

impl Default for HealthGatePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval_ms: 1000,
            timeout_ms: 8000,
        }
    }
}

impl HealthGatePolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Berth configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    /// Root directory holding `releases/`, `current` and `runtime/`.
    pub root: PathBuf,
    /// Process-manager unit serving the active release.
    pub service_name: String,
    /// Prefix process-manager commands with `sudo -n`.
    pub use_sudo: bool,
    /// Interpreter used to bootstrap per-release runtimes.
    pub python: String,
    /// Host the health probe connects to.
    pub health_host: String,
    /// Health-gate policy.
    pub health: HealthGatePolicy,
    /// Maximum characters of diagnostic text kept per validation stage.
    pub diagnostic_cap: usize,
    /// Upper bound for a single command inside a runtime.
    pub command_timeout_secs: u64,
}

impl Default for BerthConfig {
    fn default() -> Self {
        BerthConfig {
            root: PathBuf::from("/opt/release_manager"),
            service_name: "ml-release-service".to_string(),
            use_sudo: true,
            python: "python3".to_string(),
            health_host: "127.0.0.1".to_string(),
            health: HealthGatePolicy::default(),
            diagnostic_cap: 1200,
            command_timeout_secs: 300,
        }
    }
}

impl BerthConfig {
    /// Defaults overridden by `BERTH_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(root) = std::env::var("BERTH_ROOT") {
            config.root = PathBuf::from(root);
        }
        if let Ok(service) = std::env::var("BERTH_SERVICE") {
            config.service_name = service;
        }
        if let Ok(python) = std::env::var("BERTH_PYTHON") {
            config.python = python;
        }
        if let Ok(host) = std::env::var("BERTH_HEALTH_HOST") {
            config.health_host = host;
        }
        if let Ok(sudo) = std::env::var("BERTH_USE_SUDO") {
            config.use_sudo = matches!(sudo.as_str(), "1" | "true" | "yes");
        }
        config
    }

    /// Load a JSON config file; absent fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| BerthError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Overlay the fields present in a JSON config file onto `self`.
    ///
    /// Unlike [`BerthConfig::from_file`], absent fields keep their current
    /// value rather than the default, so env overrides survive.
    pub fn merge_file(self, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let overlay: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| BerthError::Config(format!("{}: {}", path.display(), e)))?;
        let mut base = serde_json::to_value(&self)?;
        merge_json(&mut base, overlay);
        serde_json::from_value(base)
            .map_err(|e| BerthError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Config rooted at `root`, other fields default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        BerthConfig {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    pub fn current_link(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn failure_record_path(&self) -> PathBuf {
        self.runtime_dir().join("last_deploy_failure.txt")
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
