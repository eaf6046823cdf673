//! Sanitized release names.

use serde::{Deserialize, Serialize};

use super::error::{BerthError, Result};

/// Name of a release, restricted to `[A-Za-z0-9_-]`.
///
/// Construction always goes through [`ReleaseName::sanitize`], which drops
/// every other character and trims leading/trailing `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReleaseName(String);

impl ReleaseName {
    /// Sanitize a raw name; fails when nothing safe remains.
    pub fn sanitize(raw: &str) -> Result<Self> {
        let kept: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        let trimmed = kept.trim_matches(|c| c == '_' || c == '-');
        if trimmed.is_empty() {
            return Err(BerthError::InvalidName(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReleaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ReleaseName {
    type Error = BerthError;

    fn try_from(value: String) -> Result<Self> {
        Self::sanitize(&value)
    }
}

impl From<ReleaseName> for String {
    fn from(value: ReleaseName) -> Self {
        value.0
    }
}
