//! Filesystem-backed release registry.
//!
//! Layout: `<releases_dir>/<name>/` per release. Mutations that must not
//! touch the active release (`delete`, `edit`) run under the pointer lock so
//! a concurrent deploy cannot activate the release halfway through.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_env::RUNTIME_DIR;
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::{self, ArchiveInfo};
use crate::domain::release::{
    ARCHIVE_DIGEST_FILE, ARCHIVE_FILE, INSTALL_LOCK_FILE, PROGRESS_FILE, REPORT_FILE,
};
use crate::domain::{
    BerthError, Manifest, Release, ReleaseEdit, ReleaseName, ReleaseStatus, ReleaseSummary,
    Result, UploadMeta, ValidationReport,
};
use crate::fsutil;
use crate::pointer::ActivePointer;

/// Registry of release directories.
pub struct ReleaseStore {
    releases_dir: PathBuf,
    pointer: Arc<ActivePointer>,
}

impl ReleaseStore {
    pub fn new(releases_dir: impl Into<PathBuf>, pointer: Arc<ActivePointer>) -> Self {
        Self {
            releases_dir: releases_dir.into(),
            pointer,
        }
    }

    pub fn releases_dir(&self) -> &Path {
        &self.releases_dir
    }

    fn release_for(&self, name: ReleaseName) -> Release {
        let dir = self.releases_dir.join(name.as_str());
        Release::new(name, dir)
    }

    /// Resolve a raw name to an existing release.
    pub fn get(&self, raw: &str) -> Result<Release> {
        let name = ReleaseName::sanitize(raw)?;
        let release = self.release_for(name);
        if !release.dir.is_dir() {
            return Err(BerthError::ReleaseNotFound(release.name.to_string()));
        }
        Ok(release)
    }

    pub fn exists(&self, name: &ReleaseName) -> bool {
        self.releases_dir.join(name.as_str()).is_dir()
    }

    /// Install a staged bundle directory as a new release.
    ///
    /// The staged directory is moved (not copied) into the registry and its
    /// manifest is stamped with upload metadata and defaults.
    pub fn create(&self, raw: &str, staged: &Path, meta: &UploadMeta) -> Result<Release> {
        let name = ReleaseName::sanitize(raw)?;
        if self.exists(&name) {
            return Err(BerthError::ReleaseExists(name.to_string()));
        }
        if !staged.is_dir() {
            return Err(BerthError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("staged bundle not found: {}", staged.display()),
            )));
        }
        fs::create_dir_all(&self.releases_dir)?;

        let staging = self
            .releases_dir
            .join(format!(".staging-{}", Uuid::new_v4().simple()));
        fsutil::move_dir(staged, &staging)?;

        let manifest_path = staging.join(crate::domain::release::MANIFEST_FILE);
        let stamped = Manifest::load(&manifest_path).and_then(|mut manifest| {
            manifest.stamp_upload(name.as_str(), meta);
            manifest.save(&manifest_path)
        });
        if let Err(e) = stamped {
            warn!(release = %name, error = %e, "staged manifest unusable; kept as-is for validation");
        }

        let release = self.release_for(name);
        if let Err(e) = fs::rename(&staging, &release.dir) {
            let _ = fs::remove_dir_all(&staging);
            return Err(if release.dir.exists() {
                BerthError::ReleaseExists(release.name.to_string())
            } else {
                e.into()
            });
        }
        info!(release = %release.name, "release created");
        Ok(release)
    }

    /// Status of a release as shown in listings.
    pub fn status(&self, release: &Release) -> Result<ReleaseStatus> {
        if self.pointer.is_active(&release.name)? {
            return Ok(ReleaseStatus::Active);
        }
        Ok(match ValidationReport::load(&release.report_path()) {
            Ok(Some(report)) if report.ok => ReleaseStatus::Valid,
            Ok(Some(_)) | Err(_) => ReleaseStatus::Invalid,
            Ok(None) => ReleaseStatus::NotValidated,
        })
    }

    /// All releases ordered by name.
    pub fn list(&self) -> Result<Vec<ReleaseSummary>> {
        let entries = match fs::read_dir(&self.releases_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(raw) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match ReleaseName::sanitize(&raw) {
                Ok(name) if name.as_str() == raw => names.push(name),
                _ => continue,
            }
        }
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let release = self.release_for(name);
                Ok(ReleaseSummary {
                    name: release.name.to_string(),
                    status: self.status(&release)?,
                    has_archive: release.archive_path().is_file(),
                    manifest: Manifest::load(&release.manifest_path()).ok(),
                    path: release.dir,
                })
            })
            .collect()
    }

    /// Delete a release and its isolated runtime; refused while active.
    pub async fn delete(&self, raw: &str) -> Result<()> {
        let release = self.get(raw)?;
        let guard = self.pointer.lock().await?;
        if guard.current()?.as_ref() == Some(&release.name) {
            return Err(BerthError::ReleaseActive(release.name.to_string()));
        }
        fs::remove_dir_all(&release.dir)?;
        drop(guard);
        info!(release = %release.name, "release deleted");
        Ok(())
    }

    /// Rewrite manifest metadata; refused while active.
    ///
    /// A changed manifest clears the validation report, putting the release
    /// back to not-yet-validated.
    pub async fn edit(&self, raw: &str, edit: &ReleaseEdit) -> Result<Manifest> {
        let release = self.get(raw)?;
        let _guard = self.pointer.lock().await?;
        if self.pointer.is_active(&release.name)? {
            return Err(BerthError::ReleaseActive(release.name.to_string()));
        }

        let mut manifest = Manifest::load(&release.manifest_path())?;
        if edit.apply(&mut manifest) {
            manifest.save(&release.manifest_path())?;
            remove_if_present(&release.report_path())?;
            info!(release = %release.name, "release manifest edited");
        }
        Ok(manifest)
    }

    /// Name the next clone of `base` would get.
    pub fn next_clone_name(&self, base: &ReleaseName) -> Result<ReleaseName> {
        let pattern = Regex::new(&format!(r"^{}_copy_(\d+)$", regex::escape(base.as_str())))
            .map_err(|e| BerthError::InvalidName(e.to_string()))?;

        let mut max = 0u32;
        if let Ok(entries) = fs::read_dir(&self.releases_dir) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                if let Some(n) = pattern
                    .captures(name)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                {
                    max = max.max(n);
                }
            }
        }
        let next = max
            .checked_add(1)
            .ok_or_else(|| BerthError::InvalidName(format!("{}: no clone numbers left", base)))?;
        ReleaseName::sanitize(&format!("{}_copy_{:03}", base, next))
    }

    /// Copy a release under the next free `<name>_copy_NNN` name.
    ///
    /// The runtime, archive and install progress stay behind; the copy
    /// starts not-yet-validated.
    pub fn clone_release(&self, raw: &str) -> Result<Release> {
        let source = self.get(raw)?;
        let target = self.release_for(self.next_clone_name(&source.name)?);

        let staging = self
            .releases_dir
            .join(format!(".staging-{}", Uuid::new_v4().simple()));
        let result = fsutil::copy_tree(&source.dir, &staging, |rel| {
            rel == Path::new(RUNTIME_DIR)
                || rel == Path::new(ARCHIVE_FILE)
                || rel == Path::new(ARCHIVE_DIGEST_FILE)
                || rel == Path::new(PROGRESS_FILE)
                || rel == Path::new(INSTALL_LOCK_FILE)
                || rel == Path::new(REPORT_FILE)
        })
        .and_then(|()| {
            let manifest_path = staging.join(crate::domain::release::MANIFEST_FILE);
            if manifest_path.is_file() {
                let mut manifest = Manifest::load(&manifest_path)?;
                manifest.release_name = target.name.to_string();
                manifest.save(&manifest_path)?;
            }
            fs::rename(&staging, &target.dir)?;
            Ok(())
        });
        if let Err(e) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        info!(source = %source.name, clone = %target.name, "release cloned");
        Ok(target)
    }

    /// Canonical archive of a release, rebuilt when missing or stale.
    pub fn build_archive(&self, raw: &str) -> Result<ArchiveInfo> {
        let release = self.get(raw)?;
        archive::ensure_archive(&release)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ReleaseStore) {
        let root = tempfile::tempdir().unwrap();
        let releases = root.path().join("releases");
        let pointer = Arc::new(ActivePointer::new(root.path().join("current"), &releases));
        (root, ReleaseStore::new(releases, pointer))
    }

    fn staged(root: &Path, tag: &str) -> PathBuf {
        let dir = root.join(format!("upload-{}", tag));
        fs::create_dir_all(dir.join("service")).unwrap();
        fs::write(dir.join("service/app.py"), "app = 1\n").unwrap();
        dir
    }

    #[test]
    fn test_create_stamps_manifest_and_moves_bundle() {
        let (root, store) = store();
        let upload = staged(root.path(), "a");
        let meta = UploadMeta {
            description: "first".into(),
            api_port: Some(9000),
            created_by: "ops".into(),
        };

        let release = store.create("my release!", &upload, &meta).unwrap();
        assert_eq!(release.name.as_str(), "myrelease");
        assert!(!upload.exists());
        assert!(release.dir.join("service/app.py").is_file());

        let manifest = Manifest::load(&release.manifest_path()).unwrap();
        assert_eq!(manifest.release_name, "myrelease");
        assert_eq!(manifest.port(), 9000);
        assert_eq!(manifest.created_by, "ops");
    }

    #[test]
    fn test_create_rejects_duplicates_and_bad_names() {
        let (root, store) = store();
        store
            .create("r1", &staged(root.path(), "a"), &UploadMeta::default())
            .unwrap();

        let dup = store.create("r1", &staged(root.path(), "b"), &UploadMeta::default());
        assert!(matches!(dup, Err(BerthError::ReleaseExists(_))));
        assert!(root.path().join("upload-b").exists(), "rejected upload is untouched");

        let bad = store.create("../", &staged(root.path(), "c"), &UploadMeta::default());
        assert!(matches!(bad, Err(BerthError::InvalidName(_))));
    }

    #[test]
    fn test_list_is_sorted_with_status() {
        let (root, store) = store();
        for name in ["zeta", "alpha", "mid"] {
            store
                .create(name, &staged(root.path(), name), &UploadMeta::default())
                .unwrap();
        }
        let mid = store.get("mid").unwrap();
        ValidationReport::valid(Default::default())
            .save(&mid.report_path())
            .unwrap();

        let rows = store.list().unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert_eq!(rows[0].status, ReleaseStatus::NotValidated);
        assert_eq!(rows[1].status, ReleaseStatus::Valid);
    }

    #[test]
    fn test_clone_numbering_uses_max_suffix() {
        let (root, store) = store();
        store
            .create("r", &staged(root.path(), "r"), &UploadMeta::default())
            .unwrap();
        fs::create_dir_all(store.releases_dir().join("r_copy_001")).unwrap();
        fs::create_dir_all(store.releases_dir().join("r_copy_003")).unwrap();
        fs::create_dir_all(store.releases_dir().join("rr_copy_009")).unwrap();

        let clone = store.clone_release("r").unwrap();
        assert_eq!(clone.name.as_str(), "r_copy_004");
    }

    #[test]
    fn test_clone_numbering_refuses_to_wrap() {
        let (root, store) = store();
        store
            .create("r", &staged(root.path(), "r"), &UploadMeta::default())
            .unwrap();
        fs::create_dir_all(store.releases_dir().join(format!("r_copy_{}", u32::MAX))).unwrap();

        let res = store.clone_release("r");
        assert!(matches!(res, Err(BerthError::InvalidName(_))));
        assert!(!store.releases_dir().join("r_copy_001").exists());
        assert!(!store.releases_dir().join("r_copy_000").exists());
    }

    #[test]
    fn test_clone_starts_unvalidated_without_runtime() {
        let (root, store) = store();
        let src = store
            .create("r", &staged(root.path(), "r"), &UploadMeta::default())
            .unwrap();
        ValidationReport::valid(Default::default())
            .save(&src.report_path())
            .unwrap();
        fs::create_dir_all(src.dir.join(".venv/bin")).unwrap();

        let clone = store.clone_release("r").unwrap();
        assert_eq!(clone.name.as_str(), "r_copy_001");
        assert!(clone.dir.join("service/app.py").is_file());
        assert!(!clone.dir.join(".venv").exists());
        assert_eq!(store.status(&clone).unwrap(), ReleaseStatus::NotValidated);
        let manifest = Manifest::load(&clone.manifest_path()).unwrap();
        assert_eq!(manifest.release_name, "r_copy_001");
    }

    #[tokio::test]
    async fn test_active_release_cannot_be_deleted_or_edited() {
        let (root, store) = store();
        let release = store
            .create("live", &staged(root.path(), "live"), &UploadMeta::default())
            .unwrap();
        store.pointer.lock().await.unwrap().swap(&release).unwrap();
        let before = fs::read(release.manifest_path()).unwrap();

        let del = store.delete("live").await;
        assert!(matches!(del, Err(BerthError::ReleaseActive(_))));
        assert!(release.dir.is_dir());

        let edit = ReleaseEdit {
            description: Some("changed".into()),
            ..Default::default()
        };
        let res = store.edit("live", &edit).await;
        assert!(matches!(res, Err(BerthError::ReleaseActive(_))));
        assert_eq!(fs::read(release.manifest_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_edit_clears_report_and_delete_removes_tree() {
        let (root, store) = store();
        let release = store
            .create("r", &staged(root.path(), "r"), &UploadMeta::default())
            .unwrap();
        ValidationReport::valid(Default::default())
            .save(&release.report_path())
            .unwrap();

        let edit = ReleaseEdit {
            dependencies: Some(vec!["numpy".into()]),
            ..Default::default()
        };
        let manifest = store.edit("r", &edit).await.unwrap();
        assert_eq!(manifest.dependencies, vec!["numpy".to_string()]);
        assert_eq!(store.status(&release).unwrap(), ReleaseStatus::NotValidated);

        store.delete("r").await.unwrap();
        assert!(!release.dir.exists());
        assert!(matches!(store.get("r"), Err(BerthError::ReleaseNotFound(_))));
    }
}
