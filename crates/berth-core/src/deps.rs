//! Dependency resolution for a release.
//!
//! The required set is the union of what the manifest declares, an optional
//! `requirements.txt` at the release root, and the base packages implied by
//! the service type. The missing set is the subset whose canonical names are
//! not installed in the release's runtime.

use std::path::Path;
use std::sync::Arc;

use berth_env::{missing_requirements, parse_requirements_file, required_set, RuntimeProvider};

use crate::domain::{Manifest, Release, Result};

pub const REQUIREMENTS_FILE: &str = "requirements.txt";

#[derive(Clone)]
pub struct DependencyResolver {
    runtime: Arc<dyn RuntimeProvider>,
}

impl DependencyResolver {
    pub fn new(runtime: Arc<dyn RuntimeProvider>) -> Self {
        Self { runtime }
    }

    /// Deduplicated requirement strings for a release, declared entries first.
    pub fn required(&self, release: &Release, manifest: &Manifest) -> Result<Vec<String>> {
        let mut declared = manifest.dependencies.clone();
        declared.extend(read_requirements_file(&release.dir)?);
        Ok(required_set(&manifest.service_type, &declared))
    }

    /// Requirements not satisfied by the release's runtime.
    ///
    /// Fails with an environment error when the runtime does not exist.
    pub async fn missing(&self, release: &Release, manifest: &Manifest) -> Result<Vec<String>> {
        let required = self.required(release, manifest)?;
        let installed = self.runtime.installed(&release.dir).await?;
        Ok(missing_requirements(&required, &installed))
    }

    /// Load the manifest and compute the missing set.
    pub async fn compute_missing(&self, release: &Release) -> Result<Vec<String>> {
        let manifest = Manifest::load(&release.manifest_path())?;
        self.missing(release, &manifest).await
    }
}

fn read_requirements_file(release_dir: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(release_dir.join(REQUIREMENTS_FILE)) {
        Ok(text) => Ok(parse_requirements_file(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReleaseName;
    use berth_env::fakes::MemoryRuntime;

    fn release(dir: &Path) -> Release {
        Release::new(ReleaseName::sanitize("r1").unwrap(), dir.to_path_buf())
    }

    #[tokio::test]
    async fn test_required_merges_manifest_file_and_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(REQUIREMENTS_FILE),
            "# pinned\nnumpy==1.26\nFastAPI>=0.110\n",
        )
        .unwrap();
        let manifest = Manifest {
            dependencies: vec!["pandas".into(), "numpy>=1.0".into()],
            ..Manifest::default()
        };
        let resolver = DependencyResolver::new(Arc::new(MemoryRuntime::new()));

        let required = resolver.required(&release(dir.path()), &manifest).unwrap();
        assert_eq!(
            required,
            vec!["pandas", "numpy>=1.0", "FastAPI>=0.110", "uvicorn"]
        );
    }

    #[tokio::test]
    async fn test_missing_is_empty_when_everything_installed() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MemoryRuntime::new().with_packages(["fastapi", "uvicorn"]));
        runtime.ensure(dir.path()).await.unwrap();
        let resolver = DependencyResolver::new(runtime.clone());

        let missing = resolver.compute_missing(&release(dir.path())).await.unwrap();
        assert!(missing.is_empty());

        runtime.uninstall(dir.path(), "uvicorn");
        let missing = resolver.compute_missing(&release(dir.path())).await.unwrap();
        assert_eq!(missing, vec!["uvicorn"]);
    }

    #[tokio::test]
    async fn test_missing_without_runtime_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DependencyResolver::new(Arc::new(MemoryRuntime::new()));
        assert!(resolver.compute_missing(&release(dir.path())).await.is_err());
    }
}
