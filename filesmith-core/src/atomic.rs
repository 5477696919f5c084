use crate::error::EngineResult;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use walkdir::WalkDir;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sibling temp path for an atomic write: `<path>.tmp.<pid>.<seq>`.
/// Staying in the target's directory keeps the final rename on one
/// filesystem.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.tmp.{}.{}", name, std::process::id(), seq))
}

/// Removes its temp file on drop unless the write completed.
pub struct TempGuard {
    path: PathBuf,
    committed: bool,
}

impl TempGuard {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if !self.committed && self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Write `bytes` to a sibling temp file, fsync, then rename onto `path`.
///
/// Readers observe either the old contents or the new, never a partial
/// file. Any failure removes the temp file and leaves the target alone.
/// Existing file permissions are carried over to the new contents.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    let temp_path = temp_sibling(path);
    let guard = TempGuard::new(temp_path);

    {
        let mut temp_file = File::create(guard.path())?;
        temp_file.write_all(bytes)?;
        temp_file.sync_all()?;
    }

    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(guard.path(), metadata.permissions())?;
    }

    fs::rename(guard.path(), path)?;
    guard.commit();

    // Make the rename durable.
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }

    Ok(())
}

/// Outcome of a recursive directory copy.
#[derive(Debug, Default)]
pub struct CopyReport {
    pub files_copied: usize,
    pub dirs_created: usize,
    /// Symlinks are skipped, never followed, and reported here.
    pub symlinks_skipped: Vec<PathBuf>,
}

/// Copy a file, creating missing parent directories.
pub fn copy_file(from: &Path, to: &Path) -> EngineResult<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(fs::copy(from, to)?)
}

/// Recursively copy a directory tree. Symbolic links are skipped and
/// recorded in the report so a link cannot smuggle content from outside
/// the source tree.
pub fn copy_directory(from: &Path, to: &Path) -> EngineResult<CopyReport> {
    let mut report = CopyReport::default();

    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .unwrap_or_else(|_| entry.path());
        let target = to.join(relative);

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            report.symlinks_skipped.push(entry.path().to_path_buf());
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            report.dirs_created += 1;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            report.files_copied += 1;
        }
    }

    Ok(report)
}
