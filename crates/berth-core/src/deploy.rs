//! Deployment orchestration: precheck, pointer swap, restart, health gate,
//! and automatic rollback.
//!
//! The pointer lock is held only while the pointer is read or changed. The
//! validation report is checked again under the lock right before the swap,
//! since an edit may have cleared it after precheck. The health gate runs
//! unlocked, so a rollback re-checks that the pointer still references the
//! attempted release before touching it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use berth_env::RuntimeProvider;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{warn, Instrument};
use uuid::Uuid;

use crate::config::{BerthConfig, HealthGatePolicy};
use crate::deps::DependencyResolver;
use crate::domain::{
    BerthError, Manifest, PrecheckError, Release, ReleaseName, Result, ValidationReport,
};
use crate::fsutil;
use crate::metrics::METRICS;
use crate::obs;
use crate::pointer::ActivePointer;
use crate::probe::HealthProbe;
use crate::service::{ServiceManager, ServiceOutput};
use crate::store::ReleaseStore;

/// How a deploy that passed its prechecks ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// Health gate passed; the release is active.
    Committed { release: String, attempt_id: String },

    /// Health gate gave up and the pointer was handed back.
    RolledBack {
        release: String,
        attempt_id: String,
        restored: Option<String>,
        last_error: String,
    },

    /// Unexpected failure while changing the pointer.
    Faulted {
        release: String,
        attempt_id: String,
        error: String,
        /// Best-effort rollback failed too; the pointer may be inconsistent.
        escalated: bool,
    },
}

impl DeployOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, DeployOutcome::Committed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    HealthCheck,
    Fault,
}

impl FailureKind {
    fn as_str(self) -> &'static str {
        match self {
            FailureKind::HealthCheck => "health_check",
            FailureKind::Fault => "fault",
        }
    }
}

/// Plain-text record of the last failed deploy, for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub attempt_id: String,
    pub timestamp: DateTime<Utc>,
    pub release: String,
    pub kind: FailureKind,
    pub health_path: String,
    pub last_error: String,
    pub rollback: String,
    pub escalated: bool,
}

impl FailureRecord {
    pub fn render(&self) -> String {
        let one_line = |s: &str| s.replace(['\r', '\n'], " ");
        format!(
            "deploy failed\n\
             attempt: {}\n\
             time: {}\n\
             release: {}\n\
             kind: {}\n\
             health_path: {}\n\
             last_error: {}\n\
             rollback: {}\n\
             escalated: {}\n",
            self.attempt_id,
            self.timestamp.to_rfc3339(),
            self.release,
            self.kind.as_str(),
            self.health_path,
            one_line(&self.last_error),
            one_line(&self.rollback),
            self.escalated,
        )
    }
}

/// What a rollback did to the pointer.
#[derive(Debug)]
enum Rollback {
    Restored(ReleaseName),
    /// No previous release to return to; pointer cleared and service stopped.
    Cleared,
    /// Pointer already references the previous release.
    Unchanged,
    /// Someone else moved the pointer meanwhile.
    LeftAlone(String),
    Failed(BerthError),
}

impl Rollback {
    fn describe(&self) -> String {
        match self {
            Rollback::Restored(name) => format!("restored {}", name),
            Rollback::Cleared => "no previous release; pointer cleared".to_string(),
            Rollback::Unchanged => "pointer still on previous release".to_string(),
            Rollback::LeftAlone(why) => format!("left alone: {}", why),
            Rollback::Failed(e) => format!("rollback failed: {}", e),
        }
    }

    fn restored(&self) -> Option<String> {
        match self {
            Rollback::Restored(name) => Some(name.to_string()),
            _ => None,
        }
    }
}

/// Result of [`Deployer::deactivate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deactivation {
    pub previous: Option<String>,
    pub stop: ServiceOutput,
}

pub struct Deployer {
    store: Arc<ReleaseStore>,
    pointer: Arc<ActivePointer>,
    runtime: Arc<dyn RuntimeProvider>,
    resolver: DependencyResolver,
    service: Arc<dyn ServiceManager>,
    probe: Arc<dyn HealthProbe>,
    health_host: String,
    policy: HealthGatePolicy,
    failure_record: PathBuf,
}

impl Deployer {
    pub fn new(
        config: &BerthConfig,
        store: Arc<ReleaseStore>,
        pointer: Arc<ActivePointer>,
        runtime: Arc<dyn RuntimeProvider>,
        service: Arc<dyn ServiceManager>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            store,
            pointer,
            resolver: DependencyResolver::new(runtime.clone()),
            runtime,
            service,
            probe,
            health_host: config.health_host.clone(),
            policy: config.health.clone(),
            failure_record: config.failure_record_path(),
        }
    }

    pub fn failure_record_path(&self) -> &std::path::Path {
        &self.failure_record
    }

    /// Checks that must all pass before the pointer may move.
    pub async fn precheck(&self, raw: &str) -> Result<(Release, Manifest)> {
        let release = self.store.get(raw).map_err(|e| match e {
            BerthError::ReleaseNotFound(name) | BerthError::InvalidName(name) => {
                PrecheckError::NotFound(name).into()
            }
            other => other,
        })?;
        let name = release.name.to_string();
        check_report(&release)?;

        if !self.runtime.exists(&release.dir).await {
            return Err(PrecheckError::RuntimeMissing(name).into());
        }

        let manifest = Manifest::load(&release.manifest_path()).map_err(|e| {
            PrecheckError::Invalid {
                name: name.clone(),
                errors: vec![e.to_string()],
            }
        })?;

        // installed packages can drift after validation
        let missing = self
            .resolver
            .missing(&release, &manifest)
            .await
            .map_err(|e| PrecheckError::Invalid {
                name: name.clone(),
                errors: vec![e.to_string()],
            })?;
        if !missing.is_empty() {
            return Err(PrecheckError::MissingDependencies { name, missing }.into());
        }

        Ok((release, manifest))
    }

    /// Activate a release behind the health gate.
    ///
    /// Precheck failures are returned as `Err(BerthError::Precheck)` and leave
    /// everything untouched, as does failing to take the pointer lock. Once
    /// the pointer may move, every outcome is an `Ok(DeployOutcome)`.
    pub async fn deploy(&self, raw: &str) -> Result<DeployOutcome> {
        let (release, manifest) = self.precheck(raw).await?;
        let attempt_id = Uuid::new_v4().to_string();
        let span = obs::deploy_span(&attempt_id, release.name.as_str());
        self.run(attempt_id, release, manifest)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        attempt_id: String,
        release: Release,
        manifest: Manifest,
    ) -> Result<DeployOutcome> {
        let started = Instant::now();
        let health_path = manifest.health_path();

        let previous = {
            let guard = self.pointer.lock().await?;
            check_report(&release)?;
            let previous = match guard.current() {
                Ok(previous) => previous,
                Err(e) => {
                    drop(guard);
                    return Ok(self.fault(&attempt_id, &release, &health_path, None, e).await);
                }
            };
            obs::emit_deploy_started(
                release.name.as_str(),
                previous.as_ref().map(ReleaseName::as_str),
            );
            if let Err(e) = guard.swap(&release) {
                drop(guard);
                return Ok(self
                    .fault(&attempt_id, &release, &health_path, previous, e)
                    .await);
            }
            previous
        };
        obs::emit_pointer_swapped(release.name.as_str());

        self.request_restart(release.name.as_str()).await;

        let last_error = match self.health_gate(&release, &manifest).await {
            Ok(()) => {
                METRICS.inc_deploys_committed();
                obs::emit_deploy_committed(
                    release.name.as_str(),
                    started.elapsed().as_millis() as u64,
                );
                return Ok(DeployOutcome::Committed {
                    release: release.name.to_string(),
                    attempt_id,
                });
            }
            Err(last_error) => last_error,
        };

        let rollback = self.roll_back(&release, previous.as_ref(), false).await;
        if let Rollback::Failed(e) = &rollback {
            obs::emit_deploy_escalate(release.name.as_str(), e);
            self.write_failure_record(FailureRecord {
                attempt_id: attempt_id.clone(),
                timestamp: Utc::now(),
                release: release.name.to_string(),
                kind: FailureKind::HealthCheck,
                health_path,
                last_error: last_error.clone(),
                rollback: rollback.describe(),
                escalated: true,
            });
            METRICS.inc_deploys_faulted();
            return Ok(DeployOutcome::Faulted {
                release: release.name.to_string(),
                attempt_id,
                error: format!("{}; {}", last_error, rollback.describe()),
                escalated: true,
            });
        }

        self.write_failure_record(FailureRecord {
            attempt_id: attempt_id.clone(),
            timestamp: Utc::now(),
            release: release.name.to_string(),
            kind: FailureKind::HealthCheck,
            health_path,
            last_error: last_error.clone(),
            rollback: rollback.describe(),
            escalated: false,
        });
        METRICS.inc_deploys_rolled_back();
        let restored = rollback.restored();
        obs::emit_deploy_rolled_back(release.name.as_str(), restored.as_deref(), &last_error);
        Ok(DeployOutcome::RolledBack {
            release: release.name.to_string(),
            attempt_id,
            restored,
            last_error,
        })
    }

    /// Probe until the first 2xx or until attempts run out; returns the last
    /// probe error on failure.
    async fn health_gate(
        &self,
        release: &Release,
        manifest: &Manifest,
    ) -> std::result::Result<(), String> {
        let url = format!(
            "http://{}:{}{}",
            self.health_host,
            manifest.port(),
            manifest.health_path()
        );
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = self
                .probe
                .probe(&url, &manifest.healthcheck.method, self.policy.timeout())
                .await;
            obs::emit_probe(
                release.name.as_str(),
                attempt,
                result.success,
                &result.diagnostic,
            );
            if result.success {
                return Ok(());
            }
            last_error = result.diagnostic;
            if attempt < attempts {
                tokio::time::sleep(self.policy.interval()).await;
            }
        }
        Err(format!("{} (probed {} times at {})", last_error, attempts, url))
    }

    async fn request_restart(&self, release: &str) {
        let out = self.service.restart().await;
        if !out.success {
            obs::emit_restart_failed(release, &out.output);
        }
    }

    /// Hand the pointer back after a failed attempt.
    ///
    /// After a health failure the pointer is only moved while it still
    /// references `attempted`. After a fault it may also be missing, since
    /// the swap can fail halfway. A previous release that has disappeared
    /// cannot be restored, which fails the rollback.
    async fn roll_back(
        &self,
        attempted: &Release,
        previous: Option<&ReleaseName>,
        fault: bool,
    ) -> Rollback {
        let guard = match self.pointer.lock().await {
            Ok(guard) => guard,
            Err(e) => return Rollback::Failed(e),
        };
        let current = match guard.current() {
            Ok(current) => current,
            Err(e) => return Rollback::Failed(e),
        };

        if current.is_some() && current.as_ref() == previous {
            return Rollback::Unchanged;
        }
        let ours = current.as_ref() == Some(&attempted.name) || (fault && current.is_none());
        if !ours {
            let why = match &current {
                Some(other) => format!("pointer moved to {} during health gate", other),
                None => "pointer cleared during health gate".to_string(),
            };
            return Rollback::LeftAlone(why);
        }

        let target = match previous {
            Some(name) => match self.store.get(name.as_str()) {
                Ok(target) => Some(target),
                Err(e) => return Rollback::Failed(e),
            },
            None => None,
        };
        match target {
            Some(target) => {
                if let Err(e) = guard.swap(&target) {
                    return Rollback::Failed(e);
                }
                drop(guard);
                self.request_restart(target.name.as_str()).await;
                Rollback::Restored(target.name)
            }
            None => {
                if let Err(e) = guard.clear() {
                    return Rollback::Failed(e);
                }
                drop(guard);
                let out = self.service.stop().await;
                if !out.success {
                    warn!(
                        release = %attempted.name,
                        output = %out.output,
                        "stop after rollback failed"
                    );
                }
                Rollback::Cleared
            }
        }
    }

    async fn fault(
        &self,
        attempt_id: &str,
        release: &Release,
        health_path: &str,
        previous: Option<ReleaseName>,
        error: BerthError,
    ) -> DeployOutcome {
        obs::emit_deploy_faulted(release.name.as_str(), &error);
        let rollback = self.roll_back(release, previous.as_ref(), true).await;
        let escalated = matches!(rollback, Rollback::Failed(_));
        if let Rollback::Failed(e) = &rollback {
            obs::emit_deploy_escalate(release.name.as_str(), e);
        }

        self.write_failure_record(FailureRecord {
            attempt_id: attempt_id.to_string(),
            timestamp: Utc::now(),
            release: release.name.to_string(),
            kind: FailureKind::Fault,
            health_path: health_path.to_string(),
            last_error: error.to_string(),
            rollback: rollback.describe(),
            escalated,
        });
        METRICS.inc_deploys_faulted();
        DeployOutcome::Faulted {
            release: release.name.to_string(),
            attempt_id: attempt_id.to_string(),
            error: error.to_string(),
            escalated,
        }
    }

    fn write_failure_record(&self, record: FailureRecord) {
        if let Err(e) = fsutil::write_atomic(&self.failure_record, record.render().as_bytes()) {
            warn!(
                path = %self.failure_record.display(),
                error = %e,
                "failed to write deploy failure record"
            );
        }
    }

    /// Stop the service and clear the pointer, whatever form it has.
    pub async fn deactivate(&self) -> Result<Deactivation> {
        let guard = self.pointer.lock().await?;
        let previous = guard.current().ok().flatten().map(|n| n.to_string());
        let stop = self.service.stop().await;
        if !stop.success {
            warn!(output = %stop.output, "service stop reported failure; clearing pointer anyway");
        }
        guard.clear()?;
        drop(guard);
        obs::emit_deactivated(previous.as_deref(), stop.success);
        Ok(Deactivation { previous, stop })
    }
}

/// The release must carry a passing validation report.
fn check_report(release: &Release) -> Result<()> {
    let name = release.name.to_string();
    match ValidationReport::load(&release.report_path()) {
        Ok(None) => Err(PrecheckError::NotValidated(name).into()),
        Ok(Some(report)) if !report.ok => Err(PrecheckError::Invalid {
            name,
            errors: report.errors,
        }
        .into()),
        Ok(Some(_)) => Ok(()),
        Err(e) => Err(PrecheckError::Invalid {
            name,
            errors: vec![format!("unreadable validation report: {}", e)],
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_failure_record_renders_one_field_per_line() {
        let record = FailureRecord {
            attempt_id: "a-1".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            release: "r2".into(),
            kind: FailureKind::HealthCheck,
            health_path: "/health".into(),
            last_error: "HTTP 503:\nwarming up".into(),
            rollback: "restored r1".into(),
            escalated: false,
        };
        let text = record.render();
        assert!(text.contains("release: r2\n"));
        assert!(text.contains("kind: health_check\n"));
        assert!(text.contains("last_error: HTTP 503: warming up\n"));
        assert!(text.contains("time: 2026-01-02T03:04:05+00:00\n"));
        assert_eq!(text.lines().count(), 9);
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome = DeployOutcome::RolledBack {
            release: "r2".into(),
            attempt_id: "a".into(),
            restored: Some("r1".into()),
            last_error: "HTTP 500".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "rolled_back");
        assert_eq!(json["restored"], "r1");
        assert!(!outcome.is_committed());
    }
}
