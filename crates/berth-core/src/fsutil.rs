//! Filesystem helpers shared by the store, validator and installer.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;
use serde::Serialize;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::domain::Result;

/// Replace `path` with `bytes` without readers ever seeing a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    // Atomic write: write to temp file in the same directory, then rename.
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Recursively copy `src` into `dst` (created if needed).
///
/// `skip` receives paths relative to `src`; a skipped directory is not
/// descended into. Symbolic links are recreated, not followed.
pub fn copy_tree<F>(src: &Path, dst: &Path, skip: F) -> Result<()>
where
    F: Fn(&Path) -> bool,
{
    fs::create_dir_all(dst)?;
    let walker = WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match entry.path().strip_prefix(src) {
            Ok(rel) => rel.as_os_str().is_empty() || !skip(rel),
            Err(_) => false,
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk error"))
        })?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Move a directory, falling back to copy + remove across filesystems.
pub fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_tree(src, dst, |_| false)?;
            fs::remove_dir_all(src)?;
            Ok(())
        }
    }
}

/// Open (creating) `path` and take an exclusive advisory lock without
/// blocking.
///
/// Returns `None` while another handle, in this process or any other, holds
/// the lock. The lock is released when the returned file is dropped.
pub fn try_lock_file(path: &Path) -> Result<Option<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(e) => Err(e.into()),
    }
}
