//! Error types for berth-env

use thiserror::Error;

/// Errors that can occur while provisioning or driving an isolated runtime
#[derive(Error, Debug)]
pub enum EnvError {
    /// Interpreter used to bootstrap runtimes could not be started
    #[error("Python interpreter not available: {0}")]
    PythonNotFound(String),

    /// Runtime has not been created for this release yet
    #[error("Isolated runtime missing at: {0}")]
    RuntimeMissing(String),

    /// A runtime command ran but reported failure
    #[error("Runtime command failed: {0}")]
    CommandFailed(String),

    /// A runtime command exceeded its time budget
    #[error("Runtime command `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// Requirement string could not be parsed
    #[error("Invalid requirement: {0}")]
    InvalidRequirement(String),

    /// Module path or attribute is not a valid dotted identifier
    #[error("Invalid entrypoint: {0}")]
    InvalidEntrypoint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
