//! Releases and their on-disk layout.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::manifest::Manifest;
use super::name::ReleaseName;

pub const MANIFEST_FILE: &str = "release.json";
pub const REPORT_FILE: &str = "validation_report.json";
pub const PROGRESS_FILE: &str = "install_progress.json";
pub const ARCHIVE_FILE: &str = "release_bundle.tar.gz";
pub const ARCHIVE_DIGEST_FILE: &str = "release_bundle.sha256";
/// Held exclusively by whichever process runs an install for the release.
pub const INSTALL_LOCK_FILE: &str = ".install.lock";

/// A named release directory under `<root>/releases`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub name: ReleaseName,
    pub dir: PathBuf,
}

impl Release {
    pub fn new(name: ReleaseName, dir: PathBuf) -> Self {
        Self { name, dir }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.dir.join(PROGRESS_FILE)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(ARCHIVE_FILE)
    }

    pub fn archive_digest_path(&self) -> PathBuf {
        self.dir.join(ARCHIVE_DIGEST_FILE)
    }

    pub fn install_lock_path(&self) -> PathBuf {
        self.dir.join(INSTALL_LOCK_FILE)
    }

    pub fn path(&self, relative: &Path) -> PathBuf {
        self.dir.join(relative)
    }
}

/// Status shown for a release in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseStatus {
    Active,
    Valid,
    Invalid,
    NotValidated,
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReleaseStatus::Active => "ACTIVE",
            ReleaseStatus::Valid => "VALID",
            ReleaseStatus::Invalid => "INVALID",
            ReleaseStatus::NotValidated => "NOT_VALIDATED",
        };
        f.write_str(s)
    }
}

/// One row of [`crate::store::ReleaseStore::list`].
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseSummary {
    pub name: String,
    pub path: PathBuf,
    pub status: ReleaseStatus,
    pub has_archive: bool,
    /// `None` when the manifest is unreadable.
    pub manifest: Option<Manifest>,
}

/// Metadata handed over with a staged bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMeta {
    pub description: String,
    pub api_port: Option<u16>,
    pub created_by: String,
}

/// Changes accepted by [`crate::store::ReleaseStore::edit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseEdit {
    pub description: Option<String>,
    pub api_port: Option<u16>,
    pub dependencies: Option<Vec<String>>,
}

impl ReleaseEdit {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.api_port.is_none() && self.dependencies.is_none()
    }

    /// Apply to a manifest; returns whether anything changed.
    pub fn apply(&self, manifest: &mut Manifest) -> bool {
        let before = manifest.clone();
        if let Some(description) = &self.description {
            manifest.description = description.clone();
        }
        if let Some(port) = self.api_port {
            manifest.api_port = Some(port);
        }
        if let Some(deps) = &self.dependencies {
            manifest.dependencies = deps.clone();
        }
        *manifest != before
    }
}
