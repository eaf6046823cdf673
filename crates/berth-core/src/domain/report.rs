//! Validation report (`validation_report.json`).

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Result, ValidationError};
use crate::fsutil;

/// Verdict of the latest validation run; rewritten wholesale every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub timestamp: DateTime<Utc>,
    pub errors: Vec<String>,
    /// Stage name to truncated diagnostic output.
    #[serde(default)]
    pub diagnostics: BTreeMap<String, String>,
}

impl ValidationReport {
    pub fn valid(diagnostics: BTreeMap<String, String>) -> Self {
        Self {
            ok: true,
            timestamp: Utc::now(),
            errors: Vec::new(),
            diagnostics,
        }
    }

    pub fn invalid(error: &ValidationError, diagnostics: BTreeMap<String, String>) -> Self {
        Self {
            ok: false,
            timestamp: Utc::now(),
            errors: vec![error.to_string()],
            diagnostics,
        }
    }

    /// Read the persisted report; `None` when the release was never validated.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fsutil::write_json_atomic(path, self)
    }
}

/// Cut `text` to at most `cap` characters, marking the cut.
pub fn truncate_diagnostic(text: &str, cap: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let mut out: String = text.chars().take(cap).collect();
    out.push_str("...[truncated]");
    out
}
