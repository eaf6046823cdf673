//! In-memory fakes for the runtime provider (testing only)
//!
//! `MemoryRuntime` keeps package sets in memory but materialises the runtime
//! directory on disk, so deleting or cloning a release directory behaves the
//! same way it does with real virtualenvs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EnvError;
use crate::requirements::canonical_name;
use crate::runtime::{CommandOutput, RuntimeProvider};
use crate::Result;

#[derive(Debug, Default)]
struct State {
    installed: HashMap<PathBuf, BTreeSet<String>>,
    created: usize,
    install_log: Vec<String>,
}

/// Scriptable in-memory [`RuntimeProvider`].
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
    baseline: BTreeSet<String>,
    failing_installs: HashSet<String>,
    compile_failure: Option<String>,
    import_failure: Option<String>,
    install_delay: Duration,
    fail_create: bool,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packages every newly created runtime starts with.
    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.baseline
            .extend(packages.into_iter().filter_map(|p| canonical_name(p.as_ref())));
        self
    }

    /// Make installs of this package fail.
    pub fn with_failing_install(mut self, package: &str) -> Self {
        if let Some(name) = canonical_name(package) {
            self.failing_installs.insert(name);
        }
        self
    }

    pub fn with_compile_failure(mut self, output: &str) -> Self {
        self.compile_failure = Some(output.to_string());
        self
    }

    pub fn with_import_failure(mut self, output: &str) -> Self {
        self.import_failure = Some(output.to_string());
        self
    }

    /// Sleep this long inside every install, to observe progress mid-run.
    pub fn with_install_delay(mut self, delay: Duration) -> Self {
        self.install_delay = delay;
        self
    }

    /// Make runtime creation fail.
    pub fn with_failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Number of runtimes created so far.
    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created
    }

    /// Requirement strings passed to `install`, in call order.
    pub fn install_log(&self) -> Vec<String> {
        self.state.lock().unwrap().install_log.clone()
    }

    /// Drop a package from a release's runtime (simulates drift after validation).
    pub fn uninstall(&self, release_dir: &Path, package: &str) {
        let mut state = self.state.lock().unwrap();
        if let (Some(set), Some(name)) = (state.installed.get_mut(release_dir), canonical_name(package)) {
            set.remove(&name);
        }
    }
}

#[async_trait]
impl RuntimeProvider for MemoryRuntime {
    async fn exists(&self, release_dir: &Path) -> bool {
        self.location(release_dir).is_dir()
    }

    async fn ensure(&self, release_dir: &Path) -> Result<bool> {
        if self.exists(release_dir).await {
            return Ok(false);
        }
        if self.fail_create {
            return Err(EnvError::CommandFailed("venv creation refused".to_string()));
        }
        std::fs::create_dir_all(self.location(release_dir))?;
        let mut state = self.state.lock().unwrap();
        state.created += 1;
        state
            .installed
            .insert(release_dir.to_path_buf(), self.baseline.clone());
        Ok(true)
    }

    async fn installed(&self, release_dir: &Path) -> Result<BTreeSet<String>> {
        if !self.exists(release_dir).await {
            return Err(EnvError::RuntimeMissing(
                self.location(release_dir).display().to_string(),
            ));
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .installed
            .get(release_dir)
            .cloned()
            .unwrap_or_else(|| self.baseline.clone()))
    }

    async fn install(&self, release_dir: &Path, requirement: &str) -> Result<CommandOutput> {
        if !self.install_delay.is_zero() {
            tokio::time::sleep(self.install_delay).await;
        }
        let name = canonical_name(requirement)
            .ok_or_else(|| EnvError::InvalidRequirement(requirement.to_string()))?;

        let mut state = self.state.lock().unwrap();
        state.install_log.push(requirement.to_string());
        if self.failing_installs.contains(&name) {
            return Ok(CommandOutput::failed(
                1,
                format!("ERROR: No matching distribution found for {}", requirement),
            ));
        }
        state
            .installed
            .entry(release_dir.to_path_buf())
            .or_insert_with(|| self.baseline.clone())
            .insert(name);
        Ok(CommandOutput::ok(format!("Successfully installed {}", requirement)))
    }

    async fn compile_check(&self, release_dir: &Path, source: &Path) -> Result<CommandOutput> {
        if !release_dir.join(source).is_file() {
            return Ok(CommandOutput::failed(
                1,
                format!("[Errno 2] No such file or directory: '{}'", source.display()),
            ));
        }
        Ok(match &self.compile_failure {
            Some(out) => CommandOutput::failed(1, out.clone()),
            None => CommandOutput::ok(""),
        })
    }

    async fn import_check(
        &self,
        _release_dir: &Path,
        _module: &str,
        _attribute: &str,
    ) -> Result<CommandOutput> {
        Ok(match &self.import_failure {
            Some(out) => CommandOutput::failed(1, out.clone()),
            None => CommandOutput::ok(""),
        })
    }
}
