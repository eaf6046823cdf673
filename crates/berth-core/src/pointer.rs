//! The active-release pointer.
//!
//! `<root>/current` is a symbolic link to the release directory that is
//! serving traffic. Reads go straight to the filesystem; every mutation goes
//! through a [`PointerGuard`], which only exists while the pointer lock is
//! held. The lock is an in-process mutex plus an exclusive lock on
//! `<root>/current.lock`, so separate `berth` processes serialize too.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{BerthError, Release, ReleaseName, Result};
use crate::fsutil;

/// Pause between attempts on a lock file held by another process.
const LOCK_RETRY: Duration = Duration::from_millis(20);

/// What `<root>/current` currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerState {
    /// No pointer on disk.
    Empty,
    /// Symbolic link to an existing release.
    Release(ReleaseName),
    /// Symbolic link whose target is not an existing release.
    Dangling(PathBuf),
    /// A real directory left behind by an inconsistent earlier state.
    RawDirectory,
}

/// Single-writer owner of the active pointer.
#[derive(Debug)]
pub struct ActivePointer {
    link: PathBuf,
    releases_dir: PathBuf,
    lock_file: PathBuf,
    lock: Mutex<()>,
}

impl ActivePointer {
    pub fn new(link: impl Into<PathBuf>, releases_dir: impl Into<PathBuf>) -> Self {
        let link = link.into();
        let mut lock_name = link
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "current".into());
        lock_name.push(".lock");
        Self {
            lock_file: link.with_file_name(lock_name),
            link,
            releases_dir: releases_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn link_path(&self) -> &Path {
        &self.link
    }

    /// Inspect the pointer without taking the lock.
    pub fn state(&self) -> Result<PointerState> {
        read_state(&self.link, &self.releases_dir)
    }

    /// Release the pointer references, if any.
    pub fn current(&self) -> Result<Option<ReleaseName>> {
        Ok(match self.state()? {
            PointerState::Release(name) => Some(name),
            _ => None,
        })
    }

    pub fn is_active(&self, name: &ReleaseName) -> Result<bool> {
        Ok(self.current()?.as_ref() == Some(name))
    }

    /// Acquire the pointer lock, waiting for other tasks and processes.
    pub async fn lock(&self) -> Result<PointerGuard<'_>> {
        let guard = self.lock.lock().await;
        let file = loop {
            match fsutil::try_lock_file(&self.lock_file)? {
                Some(file) => break file,
                None => tokio::time::sleep(LOCK_RETRY).await,
            }
        };
        debug!(link = %self.link.display(), "pointer lock acquired");
        Ok(PointerGuard {
            pointer: self,
            _file: file,
            _guard: guard,
        })
    }
}

/// Exclusive access to the active pointer.
pub struct PointerGuard<'a> {
    pointer: &'a ActivePointer,
    _file: File,
    _guard: MutexGuard<'a, ()>,
}

impl PointerGuard<'_> {
    pub fn state(&self) -> Result<PointerState> {
        self.pointer.state()
    }

    pub fn current(&self) -> Result<Option<ReleaseName>> {
        self.pointer.current()
    }

    /// Point at `release`.
    ///
    /// The new link is created under a unique temporary name and renamed over
    /// the old one, so readers see either the previous or the new target.
    /// A raw directory in the pointer's place is removed first.
    pub fn swap(&self, release: &Release) -> Result<()> {
        let link = &self.pointer.link;
        if !release.dir.is_dir() {
            return Err(BerthError::ReleaseNotFound(release.name.to_string()));
        }
        if matches!(self.state()?, PointerState::RawDirectory) {
            warn!(link = %link.display(), "removing raw directory in place of pointer");
            fs::remove_dir_all(link)?;
        }

        let parent = link.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(".current-{}", Uuid::new_v4().simple()));
        std::os::unix::fs::symlink(&release.dir, &tmp)?;
        if let Err(e) = fs::rename(&tmp, link) {
            let _ = fs::remove_file(&tmp);
            return Err(BerthError::Pointer(format!(
                "failed to repoint {} to {}: {}",
                link.display(),
                release.dir.display(),
                e
            )));
        }
        Ok(())
    }

    /// Remove the pointer whatever form it has; returns whether anything was removed.
    pub fn clear(&self) -> Result<bool> {
        let link = &self.pointer.link;
        match fs::symlink_metadata(link) {
            Ok(meta) if meta.file_type().is_dir() => {
                fs::remove_dir_all(link)?;
                Ok(true)
            }
            Ok(_) => {
                fs::remove_file(link)?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_state(link: &Path, releases_dir: &Path) -> Result<PointerState> {
    let meta = match fs::symlink_metadata(link) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PointerState::Empty),
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_dir() {
        return Ok(PointerState::RawDirectory);
    }
    if !meta.file_type().is_symlink() {
        return Ok(PointerState::Dangling(link.to_path_buf()));
    }

    let target = fs::read_link(link)?;
    let resolved = if target.is_absolute() {
        target
    } else {
        link.parent().unwrap_or_else(|| Path::new(".")).join(target)
    };

    let name = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| ReleaseName::sanitize(n).ok().filter(|s| s.as_str() == n));
    let Some(name) = name else {
        return Ok(PointerState::Dangling(resolved));
    };

    let expected = releases_dir.join(name.as_str());
    let same = match (fs::canonicalize(&resolved), fs::canonicalize(&expected)) {
        (Ok(a), Ok(b)) => a == b && b.is_dir(),
        _ => false,
    };
    if same {
        Ok(PointerState::Release(name))
    } else {
        Ok(PointerState::Dangling(resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, ActivePointer, Release, Release) {
        let root = tempfile::tempdir().unwrap();
        let releases = root.path().join("releases");
        let a = Release::new(ReleaseName::sanitize("a").unwrap(), releases.join("a"));
        let b = Release::new(ReleaseName::sanitize("b").unwrap(), releases.join("b"));
        fs::create_dir_all(&a.dir).unwrap();
        fs::create_dir_all(&b.dir).unwrap();
        let pointer = ActivePointer::new(root.path().join("current"), releases);
        (root, pointer, a, b)
    }

    #[tokio::test]
    async fn test_swap_and_read_back() {
        let (_root, pointer, a, b) = setup();
        assert_eq!(pointer.state().unwrap(), PointerState::Empty);

        let guard = pointer.lock().await.unwrap();
        guard.swap(&a).unwrap();
        assert_eq!(guard.current().unwrap(), Some(a.name.clone()));
        guard.swap(&b).unwrap();
        drop(guard);

        assert!(pointer.is_active(&b.name).unwrap());
        assert!(!pointer.is_active(&a.name).unwrap());
    }

    #[tokio::test]
    async fn test_swap_replaces_raw_directory() {
        let (_root, pointer, a, _b) = setup();
        fs::create_dir_all(pointer.link_path().join("stale")).unwrap();
        assert_eq!(pointer.state().unwrap(), PointerState::RawDirectory);
        assert_eq!(pointer.current().unwrap(), None);

        pointer.lock().await.unwrap().swap(&a).unwrap();
        assert_eq!(pointer.current().unwrap(), Some(a.name));
    }

    #[tokio::test]
    async fn test_clear_handles_link_and_directory() {
        let (_root, pointer, a, _b) = setup();
        let guard = pointer.lock().await.unwrap();
        guard.swap(&a).unwrap();
        assert!(guard.clear().unwrap());
        assert!(!guard.clear().unwrap());
        assert!(a.dir.is_dir(), "clearing must not touch the release");

        fs::create_dir_all(pointer.link_path()).unwrap();
        assert!(guard.clear().unwrap());
        assert_eq!(guard.state().unwrap(), PointerState::Empty);
    }

    #[tokio::test]
    async fn test_dangling_link_is_not_a_release() {
        let (_root, pointer, a, _b) = setup();
        pointer.lock().await.unwrap().swap(&a).unwrap();
        fs::remove_dir_all(&a.dir).unwrap();
        assert!(matches!(pointer.state().unwrap(), PointerState::Dangling(_)));
        assert_eq!(pointer.current().unwrap(), None);
    }

    #[tokio::test]
    async fn test_swap_to_missing_release_leaves_pointer() {
        let (root, pointer, a, _b) = setup();
        pointer.lock().await.unwrap().swap(&a).unwrap();
        let ghost = Release::new(
            ReleaseName::sanitize("ghost").unwrap(),
            root.path().join("releases/ghost"),
        );
        assert!(pointer.lock().await.unwrap().swap(&ghost).is_err());
        assert_eq!(pointer.current().unwrap(), Some(a.name));
    }

    #[tokio::test]
    async fn test_lock_serializes_pointers_sharing_a_root() {
        let (root, first, a, _b) = setup();
        let second = ActivePointer::new(root.path().join("current"), root.path().join("releases"));

        let guard = first.lock().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(100), second.lock()).await;
        assert!(blocked.is_err(), "second pointer must wait for the lock file");

        guard.swap(&a).unwrap();
        drop(guard);
        let guard = second.lock().await.unwrap();
        assert_eq!(guard.current().unwrap(), Some(a.name));
        assert!(root.path().join("current.lock").is_file());
    }
}
