//! Python virtualenv runtimes
//!
//! Each release gets `<release>/.venv`, bootstrapped with `python -m venv`
//! and driven exclusively through its own interpreter, so packages installed
//! for one release never leak into another.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::EnvError;
use crate::requirements::canonical_name;
use crate::runtime::{CommandOutput, RuntimeProvider, RUNTIME_DIR};
use crate::Result;

const IMPORT_PROBE: &str =
    "import importlib, sys; getattr(importlib.import_module(sys.argv[1]), sys.argv[2])";

/// Row of `pip list --format=json`.
#[derive(Debug, Deserialize)]
struct PipPackage {
    name: String,
}

fn identifier_path() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("static regex")
    })
}

/// Virtualenv-backed [`RuntimeProvider`].
#[derive(Debug, Clone)]
pub struct VenvRuntime {
    /// Interpreter used to create new virtualenvs.
    python: String,
    /// Upper bound for any single command inside a runtime.
    command_timeout: Duration,
}

impl VenvRuntime {
    pub fn new(python: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            python: python.into(),
            command_timeout,
        }
    }

    fn interpreter(&self, release_dir: &Path) -> PathBuf {
        self.location(release_dir).join("bin").join("python")
    }

    async fn run(&self, program: &Path, args: &[&str], cwd: &Path) -> Result<CommandOutput> {
        let label = format!("{} {}", program.display(), args.join(" "));
        debug!(command = %label, cwd = %cwd.display(), "running runtime command");

        let child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EnvError::PythonNotFound(program.display().to_string())
                } else {
                    EnvError::Io(e)
                }
            })?;

        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| EnvError::Timeout {
                command: label.clone(),
                secs: self.command_timeout.as_secs(),
            })??;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            output: text,
        })
    }
}

#[async_trait]
impl RuntimeProvider for VenvRuntime {
    async fn exists(&self, release_dir: &Path) -> bool {
        tokio::fs::metadata(self.interpreter(release_dir))
            .await
            .is_ok()
    }

    async fn ensure(&self, release_dir: &Path) -> Result<bool> {
        if self.exists(release_dir).await {
            return Ok(false);
        }

        info!(release_dir = %release_dir.display(), "creating isolated runtime");
        let python = PathBuf::from(&self.python);
        let out = self.run(&python, &["-m", "venv", RUNTIME_DIR], release_dir).await?;
        if !out.success {
            warn!(release_dir = %release_dir.display(), "virtualenv creation failed");
            return Err(EnvError::CommandFailed(out.output));
        }
        Ok(true)
    }

    async fn installed(&self, release_dir: &Path) -> Result<BTreeSet<String>> {
        if !self.exists(release_dir).await {
            return Err(EnvError::RuntimeMissing(
                self.location(release_dir).display().to_string(),
            ));
        }

        let out = self
            .run(
                &self.interpreter(release_dir),
                &["-m", "pip", "list", "--format=json", "--disable-pip-version-check"],
                release_dir,
            )
            .await?;
        if !out.success {
            return Err(EnvError::CommandFailed(out.output));
        }

        // pip may print warnings after the JSON document on stderr.
        let json = out.output.lines().next().unwrap_or("[]");
        let packages: Vec<PipPackage> = serde_json::from_str(json)?;
        Ok(packages
            .iter()
            .filter_map(|p| canonical_name(&p.name))
            .collect())
    }

    async fn install(&self, release_dir: &Path, requirement: &str) -> Result<CommandOutput> {
        if requirement.trim_start().starts_with('-') {
            return Err(EnvError::InvalidRequirement(requirement.to_string()));
        }
        self.run(
            &self.interpreter(release_dir),
            &[
                "-m",
                "pip",
                "install",
                "--disable-pip-version-check",
                "--no-input",
                requirement.trim(),
            ],
            release_dir,
        )
        .await
    }

    async fn compile_check(&self, release_dir: &Path, source: &Path) -> Result<CommandOutput> {
        let source = source.to_string_lossy();
        self.run(
            &self.interpreter(release_dir),
            &["-m", "py_compile", source.as_ref()],
            release_dir,
        )
        .await
    }

    async fn import_check(
        &self,
        release_dir: &Path,
        module: &str,
        attribute: &str,
    ) -> Result<CommandOutput> {
        if !identifier_path().is_match(module) {
            return Err(EnvError::InvalidEntrypoint(module.to_string()));
        }
        if !identifier_path().is_match(attribute) || attribute.contains('.') {
            return Err(EnvError::InvalidEntrypoint(attribute.to_string()));
        }
        self.run(
            &self.interpreter(release_dir),
            &["-c", IMPORT_PROBE, module, attribute],
            release_dir,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_runtime_reports_absent() {
        let dir = tempdir().unwrap();
        let runtime = VenvRuntime::new("python3", Duration::from_secs(5));
        assert!(!runtime.exists(dir.path()).await);
        assert_eq!(runtime.location(dir.path()), dir.path().join(".venv"));
    }

    #[tokio::test]
    async fn test_installed_without_runtime_is_error() {
        let dir = tempdir().unwrap();
        let runtime = VenvRuntime::new("python3", Duration::from_secs(5));
        let err = runtime.installed(dir.path()).await.unwrap_err();
        assert!(matches!(err, EnvError::RuntimeMissing(_)));
    }

    #[tokio::test]
    async fn test_import_check_rejects_injected_module() {
        let dir = tempdir().unwrap();
        let runtime = VenvRuntime::new("python3", Duration::from_secs(5));
        let err = runtime
            .import_check(dir.path(), "os; import shutil", "app")
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::InvalidEntrypoint(_)));
    }

    #[tokio::test]
    async fn test_install_rejects_pip_options() {
        let dir = tempdir().unwrap();
        let runtime = VenvRuntime::new("python3", Duration::from_secs(5));
        let err = runtime
            .install(dir.path(), "--index-url=https://evil")
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::InvalidRequirement(_)));
    }

    #[tokio::test]
    async fn test_missing_interpreter_maps_to_python_not_found() {
        let dir = tempdir().unwrap();
        let runtime = VenvRuntime::new("/nonexistent/berth-python", Duration::from_secs(5));
        let err = runtime.ensure(dir.path()).await.unwrap_err();
        assert!(matches!(err, EnvError::PythonNotFound(_)));
    }
}
