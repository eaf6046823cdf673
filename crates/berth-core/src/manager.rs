//! `ReleaseManager`: one handle wiring every component from a config.

use std::path::Path;
use std::sync::Arc;

use berth_env::{RuntimeProvider, VenvRuntime};
use serde::Serialize;
use tracing::info;

use crate::archive::ArchiveInfo;
use crate::config::BerthConfig;
use crate::deploy::{Deactivation, DeployOutcome, Deployer};
use crate::deps::DependencyResolver;
use crate::domain::{
    InstallProgress, Manifest, Release, ReleaseEdit, ReleaseSummary, Result, UploadMeta,
    ValidationReport,
};
use crate::installer::InstallSupervisor;
use crate::pointer::ActivePointer;
use crate::probe::{HealthProbe, HttpProbe};
use crate::service::{ServiceManager, ServiceOutput, SystemdServiceManager};
use crate::store::ReleaseStore;
use crate::validator::Validator;

/// Result of [`ReleaseManager::ingest`].
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub release: String,
    pub report: ValidationReport,
    pub archive: ArchiveInfo,
}

pub struct ReleaseManager {
    config: BerthConfig,
    pointer: Arc<ActivePointer>,
    store: Arc<ReleaseStore>,
    resolver: DependencyResolver,
    validator: Validator,
    installer: InstallSupervisor,
    deployer: Deployer,
    service: Arc<dyn ServiceManager>,
}

impl ReleaseManager {
    /// Manager backed by virtualenvs, systemd and HTTP probes.
    pub fn from_config(config: BerthConfig) -> Result<Self> {
        let runtime = Arc::new(VenvRuntime::new(
            config.python.clone(),
            config.command_timeout(),
        ));
        let service = Arc::new(SystemdServiceManager::new(
            config.service_name.clone(),
            config.use_sudo,
        ));
        let probe = Arc::new(HttpProbe::new()?);
        Ok(Self::with_parts(config, runtime, service, probe))
    }

    /// Manager over injected collaborators.
    pub fn with_parts(
        config: BerthConfig,
        runtime: Arc<dyn RuntimeProvider>,
        service: Arc<dyn ServiceManager>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let pointer = Arc::new(ActivePointer::new(
            config.current_link(),
            config.releases_dir(),
        ));
        let store = Arc::new(ReleaseStore::new(config.releases_dir(), pointer.clone()));
        let resolver = DependencyResolver::new(runtime.clone());
        let validator = Validator::new(runtime.clone(), resolver.clone(), config.diagnostic_cap);
        let installer = InstallSupervisor::new(
            pointer.clone(),
            runtime.clone(),
            resolver.clone(),
            validator.clone(),
        );
        let deployer = Deployer::new(
            &config,
            store.clone(),
            pointer.clone(),
            runtime,
            service.clone(),
            probe,
        );
        Self {
            config,
            pointer,
            store,
            resolver,
            validator,
            installer,
            deployer,
            service,
        }
    }

    pub fn config(&self) -> &BerthConfig {
        &self.config
    }

    pub fn store(&self) -> &ReleaseStore {
        &self.store
    }

    pub fn pointer(&self) -> &ActivePointer {
        &self.pointer
    }

    pub fn installer(&self) -> &InstallSupervisor {
        &self.installer
    }

    pub fn deployer(&self) -> &Deployer {
        &self.deployer
    }

    pub fn list(&self) -> Result<Vec<ReleaseSummary>> {
        self.store.list()
    }

    pub fn get(&self, name: &str) -> Result<Release> {
        self.store.get(name)
    }

    /// Register a staged bundle, validate it and build its archive.
    pub async fn ingest(
        &self,
        name: &str,
        staged: &Path,
        meta: &UploadMeta,
    ) -> Result<IngestReport> {
        let release = self.store.create(name, staged, meta)?;
        let report = self.validator.validate(&release).await?;
        let archive = crate::archive::ensure_archive(&release)?;
        info!(release = %release.name, ok = report.ok, "release ingested");
        Ok(IngestReport {
            release: release.name.to_string(),
            report,
            archive,
        })
    }

    pub async fn validate(&self, name: &str) -> Result<ValidationReport> {
        let release = self.store.get(name)?;
        self.validator.validate(&release).await
    }

    pub async fn missing(&self, name: &str) -> Result<Vec<String>> {
        let release = self.store.get(name)?;
        self.resolver.compute_missing(&release).await
    }

    pub async fn install(&self, name: &str) -> Result<InstallProgress> {
        let release = self.store.get(name)?;
        self.installer.install_missing(&release).await
    }

    pub fn install_status(&self, name: &str) -> Result<InstallProgress> {
        let release = self.store.get(name)?;
        self.installer.status(&release)
    }

    /// Whether an install of `name` is in flight in any process.
    pub fn install_running(&self, name: &str) -> Result<bool> {
        let release = self.store.get(name)?;
        Ok(self.installer.is_running(&release))
    }

    /// Wait for a running install of `name`, if any.
    pub async fn join_install(&self, name: &str) -> Result<()> {
        let release = self.store.get(name)?;
        self.installer.join(&release.name).await;
        Ok(())
    }

    pub fn clone_release(&self, name: &str) -> Result<Release> {
        self.store.clone_release(name)
    }

    pub async fn edit(&self, name: &str, edit: &ReleaseEdit) -> Result<Manifest> {
        self.store.edit(name, edit).await
    }

    /// Delete a release; refused while it is active or installing.
    ///
    /// The install claim is held across the removal so no install can
    /// start on a half-deleted tree.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let release = self.store.get(name)?;
        let _claim = self.installer.claim(&release)?;
        self.store.delete(name).await
    }

    pub fn archive(&self, name: &str) -> Result<ArchiveInfo> {
        self.store.build_archive(name)
    }

    pub async fn deploy(&self, name: &str) -> Result<DeployOutcome> {
        self.deployer.deploy(name).await
    }

    pub async fn deactivate(&self) -> Result<Deactivation> {
        self.deployer.deactivate().await
    }

    pub async fn service_status(&self) -> ServiceOutput {
        self.service.status().await
    }

    /// Contents of the last deploy failure record, if one exists.
    pub fn last_failure(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(self.config.failure_record_path()) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
