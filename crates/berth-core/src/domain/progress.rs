//! Dependency install progress (`install_progress.json`).
//!
//! The record is the only channel between an install task and its pollers,
//! so it is always replaced atomically and never appended to.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::Result;
use crate::fsutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Idle,
    Running,
    Done,
    Error,
}

impl InstallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstallStatus::Done | InstallStatus::Error)
    }
}

impl std::fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstallStatus::Idle => "idle",
            InstallStatus::Running => "running",
            InstallStatus::Done => "done",
            InstallStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of one install run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallProgress {
    pub status: InstallStatus,
    /// Percentage of packages attempted, 0-100.
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for InstallProgress {
    fn default() -> Self {
        Self::idle()
    }
}

impl InstallProgress {
    pub fn idle() -> Self {
        Self {
            status: InstallStatus::Idle,
            progress: 0,
            message: "no install has run".to_string(),
            updated_at: None,
        }
    }

    pub fn running(completed: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            status: InstallStatus::Running,
            progress: percent(completed, total),
            message: message.into(),
            updated_at: Some(Utc::now()),
        }
    }

    pub fn done(message: impl Into<String>) -> Self {
        Self {
            status: InstallStatus::Done,
            progress: 100,
            message: message.into(),
            updated_at: Some(Utc::now()),
        }
    }

    /// Error state frozen at the last percentage reached.
    pub fn error(progress: u8, message: impl Into<String>) -> Self {
        Self {
            status: InstallStatus::Error,
            progress,
            message: message.into(),
            updated_at: Some(Utc::now()),
        }
    }

    /// Last snapshot on disk, or idle when no install ever ran.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::idle()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fsutil::write_json_atomic(path, self)
    }
}

fn percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((completed.min(total) * 100) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_rounds_down_and_clamps() {
        assert_eq!(percent(0, 3), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 66);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(5, 3), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn test_missing_record_reads_idle() {
        let dir = tempfile::tempdir().unwrap();
        let p = InstallProgress::load(&dir.path().join("install_progress.json")).unwrap();
        assert_eq!(p.status, InstallStatus::Idle);
        assert_eq!(p.progress, 0);
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_value(InstallProgress::error(50, "failed to install b")).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["progress"], 50);
        assert!(InstallStatus::Done.is_terminal());
        assert!(!InstallStatus::Running.is_terminal());
    }
}
