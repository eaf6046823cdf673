//! Canonical release archives.
//!
//! A release archive is a gzip-compressed tar of the release directory with
//! entries sorted by path and mtime/uid/gid zeroed, so the same tree always
//! produces the same bytes. A sidecar holds the SHA-256 fingerprint of the
//! tree the archive was built from; the archive is rebuilt whenever it is
//! missing or the fingerprint no longer matches.

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use berth_env::RUNTIME_DIR;
use flate2::{write::GzEncoder, Compression};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tar::Header;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::domain::release::{ARCHIVE_DIGEST_FILE, ARCHIVE_FILE, INSTALL_LOCK_FILE, PROGRESS_FILE};
use crate::domain::{BerthError, Release, Result};

/// Result of [`ensure_archive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    /// Fingerprint of the archived tree.
    pub fingerprint: String,
    /// Whether this call (re)built the archive.
    pub rebuilt: bool,
}

enum EntryKind {
    Dir,
    File { executable: bool, len: u64 },
    Symlink(PathBuf),
}

struct TreeEntry {
    path: PathBuf,
    rel: String,
    kind: EntryKind,
}

/// Top-level names that never belong in an archive.
fn is_excluded(rel: &Path) -> bool {
    let mut components = rel.components();
    let (Some(first), None) = (components.next(), components.next()) else {
        return false;
    };
    let name = first.as_os_str().to_string_lossy();
    name == ARCHIVE_FILE
        || name == ARCHIVE_DIGEST_FILE
        || name == PROGRESS_FILE
        || name == INSTALL_LOCK_FILE
        || name == RUNTIME_DIR
        || name.starts_with(".tmp")
}

fn normalize_archive_path(path: &Path) -> Result<String> {
    let normalized = path.to_string_lossy().replace('\\', "/");
    if normalized.starts_with('/') || normalized.is_empty() {
        return Err(BerthError::Archive(format!(
            "archive entries must be relative and non-empty (got {:?})",
            normalized
        )));
    }
    Ok(normalized)
}

/// Sorted listing of everything an archive of `root` would contain.
fn collect_tree(root: &Path) -> Result<Vec<TreeEntry>> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(|e| match e.path().strip_prefix(root) {
            Ok(rel) => !is_excluded(rel),
            Err(_) => false,
        });

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| BerthError::Archive(e.to_string()))?;
        let path = entry.path();
        if path == root {
            continue;
        }
        let rel_path = path
            .strip_prefix(root)
            .map_err(|e| BerthError::Archive(e.to_string()))?;
        let rel = normalize_archive_path(rel_path)?;
        // symlink_metadata so links are captured, never followed
        let meta = fs::symlink_metadata(path)?;
        let file_type = meta.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_symlink() {
            EntryKind::Symlink(fs::read_link(path)?)
        } else if file_type.is_file() {
            EntryKind::File {
                executable: meta.permissions().mode() & 0o111 != 0,
                len: meta.len(),
            }
        } else {
            debug!(path = %path.display(), "skipping special file during archive");
            continue;
        };
        entries.push(TreeEntry {
            path: path.to_path_buf(),
            rel,
            kind,
        });
    }
    Ok(entries)
}

/// SHA-256 over paths, kinds, modes and file contents of the archivable tree.
pub fn tree_fingerprint(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    for entry in collect_tree(root)? {
        match &entry.kind {
            EntryKind::Dir => hasher.update(format!("D {}\n", entry.rel)),
            EntryKind::Symlink(target) => {
                hasher.update(format!("L {} {}\n", entry.rel, target.to_string_lossy()))
            }
            EntryKind::File { executable, len } => {
                hasher.update(format!("F {} {} {}\n", entry.rel, executable, len));
                let mut file = File::open(&entry.path)?;
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
            }
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Write a deterministic `.tar.gz` of `root` to `out`.
pub fn write_canonical_archive(root: &Path, out: &Path) -> Result<()> {
    let dir = out.parent().unwrap_or_else(|| Path::new("."));
    let tmp = NamedTempFile::new_in(dir)?;
    let encoder = GzEncoder::new(tmp.reopen()?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in collect_tree(root)? {
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        match &entry.kind {
            EntryKind::Dir => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, Path::new(&entry.rel), std::io::empty())?;
            }
            EntryKind::File { executable, len } => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(if *executable { 0o755 } else { 0o644 });
                header.set_size(*len);
                let file = match File::open(&entry.path) {
                    Ok(file) => file,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                };
                builder.append_data(&mut header, Path::new(&entry.rel), file)?;
            }
            EntryKind::Symlink(target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                header.set_link_name(target)?;
                builder.append_data(&mut header, Path::new(&entry.rel), std::io::empty())?;
            }
        }
    }

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    tmp.persist(out).map_err(|e| e.error)?;
    Ok(())
}

/// Return the release archive, rebuilding it when missing or stale.
pub fn ensure_archive(release: &Release) -> Result<ArchiveInfo> {
    let path = release.archive_path();
    let digest_path = release.archive_digest_path();
    let fingerprint = tree_fingerprint(&release.dir)?;

    let recorded = fs::read_to_string(&digest_path).ok();
    if path.is_file() && recorded.as_deref().map(str::trim) == Some(fingerprint.as_str()) {
        return Ok(ArchiveInfo {
            path,
            fingerprint,
            rebuilt: false,
        });
    }

    info!(release = %release.name, "building canonical archive");
    write_canonical_archive(&release.dir, &path)?;
    crate::fsutil::write_atomic(&digest_path, fingerprint.as_bytes())?;
    Ok(ArchiveInfo {
        path,
        fingerprint,
        rebuilt: true,
    })
}
