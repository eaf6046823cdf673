//! Domain models for Berth.
//!
//! Canonical definitions for the persisted documents:
//! - `Manifest`: per-release runtime requirements and operational parameters
//! - `ValidationReport`: verdict of the latest validation run
//! - `InstallProgress`: snapshot of a dependency install run
//! - `Release`: a named release directory and its layout

pub mod error;
pub mod manifest;
pub mod name;
pub mod progress;
pub mod release;
pub mod report;

// Re-export main types and errors
pub use error::{BerthError, PrecheckError, Result, ValidationError};
pub use manifest::{Entrypoint, HealthCheck, Manifest, DEFAULT_API_PORT};
pub use name::ReleaseName;
pub use progress::{InstallProgress, InstallStatus};
pub use release::{Release, ReleaseEdit, ReleaseStatus, ReleaseSummary, UploadMeta};
pub use report::{truncate_diagnostic, ValidationReport};
