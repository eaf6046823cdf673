//! Structured observability hooks for release lifecycle events.
//!
//! This module provides:
//! - A deploy-scoped tracing span for instrumenting a deploy future
//! - Emission functions for deploy, validation and install events
//!
//! Events carry an `event = "<domain>.<verb>"` field so log pipelines can
//! filter on it. Verbosity follows `RUST_LOG`; see [`crate::telemetry`].

use tracing::{error, info, warn};

/// Span tagging every event of one deploy attempt.
///
/// # Example
///
/// ```ignore
/// let span = deploy_span("3f0c...", "r2");
/// run_deploy().instrument(span).await;
/// ```
pub fn deploy_span(attempt_id: &str, release: &str) -> tracing::Span {
    tracing::info_span!("berth.deploy", attempt_id = %attempt_id, release = %release)
}

/// Emit event: deploy started with the rollback candidate, if any.
pub fn emit_deploy_started(release: &str, previous: Option<&str>) {
    info!(
        event = "deploy.started",
        release = %release,
        previous = previous.unwrap_or("-"),
    );
}

pub fn emit_pointer_swapped(release: &str) {
    info!(event = "deploy.pointer_swapped", release = %release);
}

/// Emit event: one health probe finished.
pub fn emit_probe(release: &str, attempt: u32, success: bool, diagnostic: &str) {
    info!(
        event = "deploy.probe",
        release = %release,
        attempt = attempt,
        success = success,
        diagnostic = %diagnostic,
    );
}

/// Emit event: restart request reported failure (warning level).
pub fn emit_restart_failed(release: &str, output: &str) {
    warn!(event = "deploy.restart_failed", release = %release, output = %output);
}

pub fn emit_deploy_committed(release: &str, duration_ms: u64) {
    info!(event = "deploy.committed", release = %release, duration_ms = duration_ms);
}

/// Emit event: deploy rolled back after the health gate gave up.
pub fn emit_deploy_rolled_back(release: &str, restored: Option<&str>, last_error: &str) {
    warn!(
        event = "deploy.rolled_back",
        release = %release,
        restored = restored.unwrap_or("-"),
        last_error = %last_error,
    );
}

/// Emit event: unexpected fault during a deploy (warning level).
pub fn emit_deploy_faulted(release: &str, error: &dyn std::fmt::Display) {
    warn!(event = "deploy.faulted", release = %release, error = %error);
}

/// Emit event: best-effort rollback failed; operator attention needed.
pub fn emit_deploy_escalate(release: &str, error: &dyn std::fmt::Display) {
    error!(event = "deploy.escalate", release = %release, error = %error);
}

pub fn emit_deactivated(previous: Option<&str>, stop_ok: bool) {
    info!(
        event = "deploy.deactivated",
        previous = previous.unwrap_or("-"),
        stop_ok = stop_ok,
    );
}

/// Emit event: validation finished; `failed_stage` is set on INVALID.
pub fn emit_validation_finished(release: &str, ok: bool, failed_stage: Option<&str>) {
    info!(
        event = "validation.finished",
        release = %release,
        ok = ok,
        failed_stage = failed_stage.unwrap_or("-"),
    );
}

pub fn emit_install_started(release: &str, total: usize) {
    info!(event = "install.started", release = %release, total = total);
}

pub fn emit_install_progress(release: &str, requirement: &str, progress: u8) {
    info!(
        event = "install.progress",
        release = %release,
        requirement = %requirement,
        progress = progress,
    );
}

/// Emit event: install run reached a terminal state.
pub fn emit_install_finished(release: &str, ok: bool, message: &str) {
    if ok {
        info!(event = "install.finished", release = %release, ok = ok, message = %message);
    } else {
        warn!(event = "install.finished", release = %release, ok = ok, message = %message);
    }
}
