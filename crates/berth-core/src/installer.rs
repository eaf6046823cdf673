//! Background dependency installation.
//!
//! Each install run is a tokio task keyed by release name. The task reports
//! exclusively through the release's progress record, so any poller, in
//! this process or another, sees the same snapshots. A release has at most
//! one run in flight: the run holds the release's install lock file for its
//! whole lifetime, which also keeps other processes out.

use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, Mutex};

use berth_env::RuntimeProvider;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::deps::DependencyResolver;
use crate::domain::{
    truncate_diagnostic, BerthError, InstallProgress, InstallStatus, Release, ReleaseName, Result,
};
use crate::fsutil;
use crate::metrics::METRICS;
use crate::obs;
use crate::pointer::ActivePointer;
use crate::validator::Validator;

/// Characters of installer output kept in an error message.
const INSTALL_OUTPUT_CAP: usize = 400;

/// Reported for a `running` record nobody is working on any more.
const INTERRUPTED: &str = "install interrupted before finishing; run it again";

/// `None` marks a release whose run is being prepared or joined.
type TaskMap = HashMap<ReleaseName, Option<JoinHandle<()>>>;

pub struct InstallSupervisor {
    pointer: Arc<ActivePointer>,
    runtime: Arc<dyn RuntimeProvider>,
    resolver: DependencyResolver,
    validator: Validator,
    tasks: Mutex<TaskMap>,
}

/// Exclusive right to start an install for one release, or to remove it.
///
/// Released on drop unless the lock was handed to a spawned run.
pub struct InstallClaim<'a> {
    supervisor: &'a InstallSupervisor,
    name: ReleaseName,
    lock: Option<File>,
}

impl Drop for InstallClaim<'_> {
    fn drop(&mut self) {
        self.supervisor.unclaim(&self.name);
    }
}

impl InstallSupervisor {
    pub fn new(
        pointer: Arc<ActivePointer>,
        runtime: Arc<dyn RuntimeProvider>,
        resolver: DependencyResolver,
        validator: Validator,
    ) -> Self {
        Self {
            pointer,
            runtime,
            resolver,
            validator,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an install run for the release is in flight, here or in
    /// another process.
    pub fn is_running(&self, release: &Release) -> bool {
        if self.busy_here(&release.name) {
            return true;
        }
        let path = release.install_lock_path();
        if !path.exists() {
            return false;
        }
        matches!(fsutil::try_lock_file(&path), Ok(None))
    }

    fn busy_here(&self, name: &ReleaseName) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        task_busy(&tasks, name)
    }

    /// Take the release's install lock, refusing if a run holds it.
    pub fn claim(&self, release: &Release) -> Result<InstallClaim<'_>> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if task_busy(&tasks, &release.name) {
            return Err(BerthError::InstallInProgress(release.name.to_string()));
        }
        let Some(lock) = fsutil::try_lock_file(&release.install_lock_path())? else {
            return Err(BerthError::InstallInProgress(release.name.to_string()));
        };
        tasks.insert(release.name.clone(), None);
        Ok(InstallClaim {
            supervisor: self,
            name: release.name.clone(),
            lock: Some(lock),
        })
    }

    fn unclaim(&self, name: &ReleaseName) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(tasks.get(name), Some(None)) {
            tasks.remove(name);
        }
    }

    /// Start installing whatever the release is missing.
    ///
    /// Returns the initial snapshot. With nothing missing the run finishes
    /// immediately (`done`, 100%) and no task is spawned.
    pub async fn install_missing(&self, release: &Release) -> Result<InstallProgress> {
        if self.pointer.is_active(&release.name)? {
            return Err(BerthError::ReleaseActive(release.name.to_string()));
        }
        let mut claim = self.claim(release)?;
        let missing = self.prepare(release).await?;

        if missing.is_empty() {
            let done = InstallProgress::done("all dependencies already installed");
            done.save(&release.progress_path())?;
            obs::emit_install_finished(release.name.as_str(), true, &done.message);
            return Ok(done);
        }

        let initial = InstallProgress::running(
            0,
            missing.len(),
            format!("installing {} packages", missing.len()),
        );
        initial.save(&release.progress_path())?;

        obs::emit_install_started(release.name.as_str(), missing.len());
        METRICS.inc_installs();
        let handle = tokio::spawn(run_install(
            self.runtime.clone(),
            self.validator.clone(),
            release.clone(),
            missing,
            claim.lock.take(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(release.name.clone(), Some(handle));
        Ok(initial)
    }

    async fn prepare(&self, release: &Release) -> Result<Vec<String>> {
        if self.runtime.ensure(&release.dir).await? {
            debug!(release = %release.name, "isolated runtime created for install");
        }
        self.resolver.compute_missing(release).await
    }

    /// Last known progress snapshot; idle when no install ever ran.
    ///
    /// A `running` record with no live run behind it (the owning process
    /// exited or crashed) reads as an error at the percentage it reached.
    pub fn status(&self, release: &Release) -> Result<InstallProgress> {
        let progress = InstallProgress::load(&release.progress_path())?;
        if progress.status == InstallStatus::Running && !self.is_running(release) {
            return Ok(InstallProgress::error(progress.progress, INTERRUPTED));
        }
        Ok(progress)
    }

    /// Wait for the in-flight run of `name`, if any, to finish.
    pub async fn join(&self, name: &ReleaseName) {
        let handle = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.get_mut(name).and_then(Option::take)
        };
        let Some(handle) = handle else {
            return;
        };
        if let Err(e) = handle.await {
            warn!(release = %name, error = %e, "install task ended abnormally");
        }
        self.unclaim(name);
    }
}

fn task_busy(tasks: &TaskMap, name: &ReleaseName) -> bool {
    match tasks.get(name) {
        Some(Some(handle)) => !handle.is_finished(),
        Some(None) => true,
        None => false,
    }
}

/// Body of one install run.
async fn run_install(
    runtime: Arc<dyn RuntimeProvider>,
    validator: Validator,
    release: Release,
    missing: Vec<String>,
    _lock: Option<File>,
) {
    let name = release.name.as_str();
    let total = missing.len();
    let mut reached = 0u8;
    let mut failure = None;

    for (idx, requirement) in missing.iter().enumerate() {
        let problem = match runtime.install(&release.dir, requirement).await {
            Ok(out) if out.success => None,
            Ok(out) => Some(truncate_diagnostic(&out.output, INSTALL_OUTPUT_CAP)),
            Err(e) => Some(e.to_string()),
        };
        if let Some(detail) = problem {
            failure = Some(format!("failed to install {}: {}", requirement, detail));
            break;
        }

        let snapshot =
            InstallProgress::running(idx + 1, total, format!("installed {}", requirement));
        reached = snapshot.progress;
        obs::emit_install_progress(name, requirement, reached);
        write_progress(&release, &snapshot);
    }

    let terminal = match failure {
        Some(message) => InstallProgress::error(reached, message),
        None => InstallProgress::done(format!("installed {} packages", total)),
    };
    let ok = terminal.status == InstallStatus::Done;
    obs::emit_install_finished(name, ok, &terminal.message);
    write_progress(&release, &terminal);

    if let Err(e) = validator.validate(&release).await {
        warn!(release = %name, error = %e, "post-install validation could not be recorded");
    }
}

fn write_progress(release: &Release, snapshot: &InstallProgress) {
    if let Err(e) = snapshot.save(&release.progress_path()) {
        warn!(release = %release.name, error = %e, "failed to write install progress");
    }
}
