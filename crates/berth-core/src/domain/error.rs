//! Domain-level error taxonomy for Berth.

/// Reasons a validation stage marks a release INVALID.
///
/// These never escape as faults: the validator converts them into the
/// `errors` list of the persisted report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("manifest unreadable: {0}")]
    Manifest(String),

    #[error("missing required files: {}", .0.join(", "))]
    Structure(Vec<String>),

    #[error("isolated runtime unavailable: {0}")]
    Runtime(String),

    #[error("missing dependencies: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),

    #[error("compile check failed for {0}")]
    Compile(String),

    #[error("import check failed for {0}")]
    Import(String),
}

/// Deploy preconditions; each one blocks before any mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrecheckError {
    #[error("release not found: {0}")]
    NotFound(String),

    #[error("release {0} has never been validated")]
    NotValidated(String),

    #[error("release {name} is not valid: {}", .errors.join("; "))]
    Invalid { name: String, errors: Vec<String> },

    #[error("release {0} has no isolated runtime")]
    RuntimeMissing(String),

    #[error("release {name} is missing dependencies: {}", .missing.join(", "))]
    MissingDependencies { name: String, missing: Vec<String> },
}

/// Berth domain errors.
#[derive(Debug, thiserror::Error)]
pub enum BerthError {
    #[error("invalid release name: {0:?}")]
    InvalidName(String),

    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    #[error("release already exists: {0}")]
    ReleaseExists(String),

    #[error("release {0} is active and cannot be modified")]
    ReleaseActive(String),

    #[error("dependency install already running for {0}")]
    InstallInProgress(String),

    #[error("deploy precheck failed: {0}")]
    Precheck(#[from] PrecheckError),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("pointer error: {0}")]
    Pointer(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("environment error: {0}")]
    Env(#[from] berth_env::EnvError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Berth domain operations.
pub type Result<T> = std::result::Result<T, BerthError>;
