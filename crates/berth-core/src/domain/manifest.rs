//! Release manifest (`release.json`).
//!
//! Unknown fields are carried through untouched in [`Manifest::extra`] so a
//! rewrite by `edit` or `clone` never drops operator-supplied metadata.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{BerthError, Result};
use super::release::UploadMeta;
use crate::fsutil;

pub const DEFAULT_API_PORT: u16 = 8000;

/// Health endpoint declared by a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheck {
    pub path: String,
    pub method: String,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            method: "GET".to_string(),
        }
    }
}

/// `module.path:attribute` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    pub module: String,
    pub attribute: String,
}

impl Entrypoint {
    /// Parse `service.app:app`; the attribute defaults to `app`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (module, attribute) = match raw.trim().split_once(':') {
            Some((m, a)) => (m.trim(), a.trim()),
            None => (raw.trim(), "app"),
        };
        if module.is_empty()
            || attribute.is_empty()
            || module.split('.').any(|part| part.is_empty())
        {
            return Err(BerthError::Manifest(format!("invalid entrypoint {:?}", raw)));
        }
        Ok(Self {
            module: module.to_string(),
            attribute: attribute.to_string(),
        })
    }

    /// Source file relative to the release root (`service/app.py`).
    pub fn source_path(&self) -> PathBuf {
        let mut path: PathBuf = self.module.split('.').collect();
        path.set_extension("py");
        path
    }

    /// Package marker relative to the release root (`service/__init__.py`);
    /// `None` for a top-level module.
    pub fn package_marker(&self) -> Option<PathBuf> {
        let (package, _) = self.module.rsplit_once('.')?;
        let mut path: PathBuf = package.split('.').collect();
        path.push("__init__.py");
        Some(path)
    }
}

/// Release manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub release_name: String,
    pub project_name: String,
    pub service_type: String,
    pub entrypoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_port: Option<u16>,
    pub dependencies: Vec<String>,
    pub healthcheck: HealthCheck,
    pub description: String,
    pub created_by: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            release_name: String::new(),
            project_name: "generic-service".to_string(),
            service_type: "fastapi".to_string(),
            entrypoint: "service.app:app".to_string(),
            api_port: None,
            dependencies: Vec::new(),
            healthcheck: HealthCheck::default(),
            description: String::new(),
            created_by: String::new(),
            created_at: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl Manifest {
    /// Read a manifest; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| BerthError::Manifest(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fsutil::write_json_atomic(path, self)
    }

    /// Fill upload-time fields; values already present in a staged manifest
    /// win except for the creator and creation time.
    pub fn stamp_upload(&mut self, release_name: &str, meta: &UploadMeta) {
        if self.release_name.is_empty() {
            self.release_name = release_name.to_string();
        }
        if self.description.is_empty() {
            self.description = meta.description.clone();
        }
        if self.api_port.is_none() {
            self.api_port = Some(meta.api_port.unwrap_or(DEFAULT_API_PORT));
        }
        self.created_by = meta.created_by.clone();
        self.created_at = Some(Utc::now());
    }

    /// Port the served application listens on.
    pub fn port(&self) -> u16 {
        self.api_port.unwrap_or(DEFAULT_API_PORT)
    }

    pub fn entrypoint(&self) -> Result<Entrypoint> {
        Entrypoint::parse(&self.entrypoint)
    }

    /// Health path with a guaranteed leading `/`.
    pub fn health_path(&self) -> String {
        let path = self.healthcheck.path.trim();
        if path.is_empty() {
            HealthCheck::default().path
        } else if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        }
    }
}
