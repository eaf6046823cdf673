//! Isolated runtime abstraction
//!
//! Every release owns exactly one runtime living inside its own directory.
//! Runtimes are created lazily on first use and are never shared or
//! garbage-collected; they disappear only together with the release
//! directory.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Directory name of the runtime inside a release directory.
pub const RUNTIME_DIR: &str = ".venv";

/// Captured result of one command run inside a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Whether the command exited successfully.
    pub success: bool,
    /// Exit code, `-1` when terminated by a signal.
    pub exit_code: i32,
    /// Interleaved stdout followed by stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: 0,
            output: output.into(),
        }
    }

    pub fn failed(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            output: output.into(),
        }
    }
}

/// Provider of per-release isolated runtimes.
///
/// All paths are release directories; the provider decides where inside the
/// directory the runtime lives (see [`RuntimeProvider::location`]).
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Where the runtime for `release_dir` lives (whether or not it exists).
    fn location(&self, release_dir: &Path) -> PathBuf {
        release_dir.join(RUNTIME_DIR)
    }

    /// Whether a usable runtime exists for this release.
    async fn exists(&self, release_dir: &Path) -> bool;

    /// Create the runtime if it does not exist yet.
    ///
    /// Returns `true` when a runtime was created by this call.
    async fn ensure(&self, release_dir: &Path) -> Result<bool>;

    /// Canonical names of the packages installed in the runtime.
    async fn installed(&self, release_dir: &Path) -> Result<BTreeSet<String>>;

    /// Install a single requirement string into the runtime.
    async fn install(&self, release_dir: &Path, requirement: &str) -> Result<CommandOutput>;

    /// Byte-compile `source` (relative to the release directory).
    async fn compile_check(&self, release_dir: &Path, source: &Path) -> Result<CommandOutput>;

    /// Import `module` with the release directory as working directory and
    /// resolve `attribute` on it.
    async fn import_check(
        &self,
        release_dir: &Path,
        module: &str,
        attribute: &str,
    ) -> Result<CommandOutput>;
}
