//! Release validation pipeline.
//!
//! Stages run in order and stop at the first failure. Whatever happens, the
//! outcome is written to the release's report; only a failure to persist the
//! report itself is returned as an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_env::{CommandOutput, RuntimeProvider};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::deps::DependencyResolver;
use crate::domain::{
    truncate_diagnostic, Entrypoint, Manifest, Release, Result, ValidationError, ValidationReport,
};
use crate::metrics::METRICS;
use crate::obs;

/// Validation stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    /// release.json parses and names a usable entrypoint
    Manifest,

    /// entrypoint source and package marker exist
    Structure,

    /// isolated runtime exists (created on first use)
    Runtime,

    /// every required package is installed
    Dependencies,

    /// entrypoint source byte-compiles
    Compile,

    /// entrypoint module imports and exposes its attribute
    Import,
}

impl ValidationStage {
    pub fn name(&self) -> &'static str {
        match self {
            ValidationStage::Manifest => "manifest",
            ValidationStage::Structure => "structure",
            ValidationStage::Runtime => "runtime",
            ValidationStage::Dependencies => "dependencies",
            ValidationStage::Compile => "compile",
            ValidationStage::Import => "import",
        }
    }
}

/// A stage failure plus the diagnostic text that goes with it.
struct StageFailure {
    stage: ValidationStage,
    error: ValidationError,
    diagnostic: String,
}

impl StageFailure {
    fn new(stage: ValidationStage, error: ValidationError, diagnostic: impl Into<String>) -> Self {
        Self {
            stage,
            error,
            diagnostic: diagnostic.into(),
        }
    }
}

#[derive(Clone)]
pub struct Validator {
    runtime: Arc<dyn RuntimeProvider>,
    resolver: DependencyResolver,
    diagnostic_cap: usize,
}

impl Validator {
    pub fn new(
        runtime: Arc<dyn RuntimeProvider>,
        resolver: DependencyResolver,
        diagnostic_cap: usize,
    ) -> Self {
        Self {
            runtime,
            resolver,
            diagnostic_cap,
        }
    }

    /// Validate a release and overwrite its report.
    pub async fn validate(&self, release: &Release) -> Result<ValidationReport> {
        let mut diagnostics = BTreeMap::new();
        let outcome = self.run_stages(release, &mut diagnostics).await;

        let report = match outcome {
            Ok(()) => {
                obs::emit_validation_finished(release.name.as_str(), true, None);
                ValidationReport::valid(diagnostics)
            }
            Err(failure) => {
                if !failure.diagnostic.trim().is_empty() {
                    diagnostics.insert(
                        failure.stage.name().to_string(),
                        truncate_diagnostic(&failure.diagnostic, self.diagnostic_cap),
                    );
                }
                obs::emit_validation_finished(
                    release.name.as_str(),
                    false,
                    Some(failure.stage.name()),
                );
                ValidationReport::invalid(&failure.error, diagnostics)
            }
        };

        report.save(&release.report_path())?;
        METRICS.inc_validations();
        Ok(report)
    }

    async fn run_stages(
        &self,
        release: &Release,
        diagnostics: &mut BTreeMap<String, String>,
    ) -> std::result::Result<(), StageFailure> {
        let dir = &release.dir;

        // manifest
        let (manifest, entrypoint) = Manifest::load(&release.manifest_path())
            .and_then(|m| m.entrypoint().map(|e| (m, e)))
            .map_err(|e| {
                StageFailure::new(
                    ValidationStage::Manifest,
                    ValidationError::Manifest(e.to_string()),
                    e.to_string(),
                )
            })?;

        // structure
        let missing_files = required_files(&entrypoint)
            .into_iter()
            .filter(|rel| !release.path(std::path::Path::new(rel)).is_file())
            .collect::<Vec<_>>();
        if !missing_files.is_empty() {
            return Err(StageFailure::new(
                ValidationStage::Structure,
                ValidationError::Structure(missing_files.clone()),
                format!("not found under {}: {}", dir.display(), missing_files.join(", ")),
            ));
        }

        // runtime
        match self.runtime.ensure(dir).await {
            Ok(true) => debug!(release = %release.name, "isolated runtime created"),
            Ok(false) => {}
            Err(e) => {
                return Err(StageFailure::new(
                    ValidationStage::Runtime,
                    ValidationError::Runtime(e.to_string()),
                    e.to_string(),
                ))
            }
        }

        // dependencies
        let missing = self
            .resolver
            .missing(release, &manifest)
            .await
            .map_err(|e| {
                StageFailure::new(
                    ValidationStage::Dependencies,
                    ValidationError::Runtime(e.to_string()),
                    e.to_string(),
                )
            })?;
        if !missing.is_empty() {
            let diagnostic = format!("not installed: {}", missing.join(", "));
            return Err(StageFailure::new(
                ValidationStage::Dependencies,
                ValidationError::MissingDependencies(missing),
                diagnostic,
            ));
        }

        // compile
        let source = entrypoint.source_path();
        let source_label = source.display().to_string();
        let out = self.runtime.compile_check(dir, &source).await;
        self.check_command(ValidationStage::Compile, out, diagnostics, || {
            ValidationError::Compile(source_label.clone())
        })?;

        // import
        let out = self
            .runtime
            .import_check(dir, &entrypoint.module, &entrypoint.attribute)
            .await;
        self.check_command(ValidationStage::Import, out, diagnostics, || {
            ValidationError::Import(format!("{}:{}", entrypoint.module, entrypoint.attribute))
        })?;

        Ok(())
    }

    /// Turn a runtime command result into pass/fail, keeping any output as
    /// the stage's diagnostic.
    fn check_command<F>(
        &self,
        stage: ValidationStage,
        result: berth_env::Result<CommandOutput>,
        diagnostics: &mut BTreeMap<String, String>,
        error: F,
    ) -> std::result::Result<(), StageFailure>
    where
        F: FnOnce() -> ValidationError,
    {
        match result {
            Ok(out) if out.success => {
                if !out.output.trim().is_empty() {
                    diagnostics.insert(
                        stage.name().to_string(),
                        truncate_diagnostic(&out.output, self.diagnostic_cap),
                    );
                }
                Ok(())
            }
            Ok(out) => Err(StageFailure::new(stage, error(), out.output)),
            Err(e) => Err(StageFailure::new(stage, error(), e.to_string())),
        }
    }
}

/// Files that must exist for `entrypoint` to be loadable, relative to the
/// release root.
fn required_files(entrypoint: &Entrypoint) -> Vec<String> {
    let mut files = vec![entrypoint.source_path().display().to_string()];
    if let Some(marker) = entrypoint.package_marker() {
        files.push(marker.display().to_string());
    }
    files
}
