//! Berth-Env: isolated per-release runtimes
//!
//! This crate provides the environment layer for Berth. Every release gets
//! its own dependency-isolated runtime (a Python virtualenv by default), and
//! requirement strings are compared against what that runtime actually has
//! installed.
//!
//! ## Layer 1 - Environment
//!
//! Focus: lazy runtime creation, canonical requirement matching, and the
//! compile/import probes the validator runs inside a runtime.

pub mod error;
pub mod fakes;
pub mod requirements;
pub mod runtime;
pub mod venv;

pub use error::EnvError;
pub use requirements::{
    base_requirements, canonical_name, dedup_requirements, missing_requirements,
    parse_requirements_file, required_set,
};
pub use runtime::{CommandOutput, RuntimeProvider, RUNTIME_DIR};
pub use venv::VenvRuntime;

/// Result type for environment operations
pub type Result<T> = std::result::Result<T, EnvError>;
