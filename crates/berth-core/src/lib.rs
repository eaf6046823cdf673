//! Berth Core Library
//!
//! Release lifecycle for a single host: register uploaded bundles, validate
//! them inside per-release isolated runtimes, install missing dependencies
//! in the background, and promote a release behind a health gate with
//! automatic rollback.
//!
//! ## Layer 2 - Releases
//!
//! Everything on disk hangs off [`BerthConfig::root`]: `releases/<name>/`,
//! the `current` pointer, and `runtime/` for operator-facing records.

pub mod archive;
pub mod config;
pub mod deploy;
pub mod deps;
pub mod domain;
pub mod fakes;
pub mod fsutil;
pub mod installer;
pub mod manager;
pub mod metrics;
pub mod obs;
pub mod pointer;
pub mod probe;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod validator;

pub use archive::{ensure_archive, tree_fingerprint, ArchiveInfo};
pub use config::{BerthConfig, HealthGatePolicy};
pub use deploy::{Deactivation, DeployOutcome, Deployer, FailureKind, FailureRecord};
pub use deps::DependencyResolver;
pub use domain::{
    BerthError, Entrypoint, HealthCheck, InstallProgress, InstallStatus, Manifest, PrecheckError,
    Release, ReleaseEdit, ReleaseName, ReleaseStatus, ReleaseSummary, Result, UploadMeta,
    ValidationError, ValidationReport,
};
pub use installer::{InstallClaim, InstallSupervisor};
pub use manager::{IngestReport, ReleaseManager};
pub use metrics::{Metrics, MetricsSnapshot, METRICS};
pub use pointer::{ActivePointer, PointerGuard, PointerState};
pub use probe::{HealthProbe, HttpProbe, ProbeResult};
pub use service::{ServiceManager, ServiceOutput, SystemdServiceManager};
pub use store::ReleaseStore;
pub use telemetry::init_tracing;
pub use validator::{ValidationStage, Validator};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
