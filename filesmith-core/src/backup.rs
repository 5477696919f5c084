use crate::config::BackupConfig;
use crate::error::{EngineError, EngineResult};
use crate::limits::BufferPool;
use chrono::{DateTime, Local, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const METADATA_FILE: &str = "metadata.json";
const FILES_DIR: &str = "files";
/// How many differing lines `compare` reports before truncating.
const COMPARE_DISPLAY_CAP: usize = 10;

static ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// One backed-up file inside a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFileEntry {
    pub original_path: PathBuf,
    /// Relative to the record directory, e.g. `files/<basename>`.
    pub backup_path: PathBuf,
    pub size: u64,
    /// Hex SHA-256 of the copied bytes.
    pub hash: String,
    pub modified_time: String,
}

/// Persisted metadata for one backup, stored as
/// `<root>/<backup_id>/metadata.json`. Immutable once written except for
/// whole-record deletion by retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    /// RFC3339 creation time.
    pub timestamp: String,
    pub operation: String,
    pub user_context: String,
    pub files: Vec<BackupFileEntry>,
    pub total_size: u64,
}

impl BackupRecord {
    pub fn entry_for(&self, path: &Path) -> Option<&BackupFileEntry> {
        self.files.iter().find(|f| f.original_path == path)
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Filters for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub limit: Option<usize>,
    pub operation: Option<String>,
    pub path_substring: Option<String>,
    pub newer_than_hours: Option<u64>,
}

/// Result of a restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub backup_id: String,
    pub restored: Vec<PathBuf>,
    /// Per-file failures; non-fatal, the caller decides how to react.
    pub warnings: Vec<String>,
    pub pre_restore_backup: Option<String>,
}

/// Result of comparing a backup entry against the live file.
#[derive(Debug, Clone, Serialize)]
pub struct CompareReport {
    pub backup_id: String,
    pub file: PathBuf,
    pub backup_lines: usize,
    pub current_lines: usize,
    pub line_delta: i64,
    pub changed_lines: usize,
    pub identical: bool,
    /// First differing lines, `-`/`+` prefixed, bounded to a display cap.
    pub first_differences: Vec<String>,
}

/// Result of age-based cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupOutcome {
    pub deleted_count: usize,
    pub freed_bytes: u64,
    pub dry_run: bool,
}

#[derive(Default)]
struct MetadataCache {
    records: Vec<BackupRecord>,
    refreshed_at: Option<Instant>,
}

/// Persistent store of prior file states keyed by opaque backup ids.
///
/// Creates, lists, restores, diffs, and expires backups. All mutations and
/// cache refreshes take the write lock; `list`/`get` read through the
/// in-memory metadata cache, which may be stale by at most the configured
/// TTL.
pub struct BackupManager {
    root: PathBuf,
    max_count: usize,
    max_age_days: u64,
    ttl: Duration,
    pool: Arc<BufferPool>,
    cache: RwLock<MetadataCache>,
}

impl BackupManager {
    pub fn new(config: &BackupConfig, pool: Arc<BufferPool>) -> Self {
        Self {
            root: config.backup_dir.clone(),
            max_count: config.max_count,
            max_age_days: config.max_age_days,
            ttl: Duration::from_secs(config.metadata_ttl_secs),
            pool,
            cache: RwLock::new(MetadataCache::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot one file. Returns the new backup id.
    pub fn create(
        &self,
        path: &Path,
        operation: &str,
        user_context: &str,
    ) -> EngineResult<String> {
        self.create_batch(std::slice::from_ref(&path.to_path_buf()), operation, user_context)
    }

    /// Snapshot many files under a single record. Unreadable inputs are
    /// skipped with a warning; the call fails only when nothing could be
    /// backed up. A failure mid-copy removes the partial record directory.
    pub fn create_batch(
        &self,
        paths: &[PathBuf],
        operation: &str,
        user_context: &str,
    ) -> EngineResult<String> {
        let mut cache = self.cache.write();

        let backup_id = self.allocate_id()?;
        let record_dir = self.root.join(&backup_id);
        let files_dir = record_dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)?;

        let mut entries = Vec::new();
        let mut total_size = 0u64;
        let mut taken_names: Vec<String> = Vec::new();

        for path in paths {
            let metadata = match fs::metadata(path) {
                Ok(m) if m.is_file() => m,
                Ok(_) => {
                    warn!(path = %path.display(), "skipping non-file input in batch backup");
                    continue;
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable input in batch backup");
                    continue;
                },
            };

            let name = unique_basename(path, &taken_names);
            taken_names.push(name.clone());
            let dest = files_dir.join(&name);

            let hash = match self.copy_hashed(path, &dest) {
                Ok(h) => h,
                Err(e) => {
                    // A partially-populated record must not survive.
                    let _ = fs::remove_dir_all(&record_dir);
                    return Err(e);
                },
            };

            let modified_time = metadata
                .modified()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                .unwrap_or_default();

            total_size += metadata.len();
            entries.push(BackupFileEntry {
                original_path: path.clone(),
                backup_path: PathBuf::from(FILES_DIR).join(&name),
                size: metadata.len(),
                hash,
                modified_time,
            });
        }

        if entries.is_empty() {
            let _ = fs::remove_dir_all(&record_dir);
            return Err(EngineError::not_found(
                "no files could be backed up (all inputs unreadable or not regular files)",
            ));
        }

        let record = BackupRecord {
            backup_id: backup_id.clone(),
            timestamp: Local::now().to_rfc3339(),
            operation: operation.to_string(),
            user_context: user_context.to_string(),
            files: entries,
            total_size,
        };

        let metadata_json = serde_json::to_string_pretty(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Err(e) = fs::write(record_dir.join(METADATA_FILE), metadata_json) {
            let _ = fs::remove_dir_all(&record_dir);
            return Err(e.into());
        }

        info!(
            backup_id = %backup_id,
            files = record.files.len(),
            bytes = record.total_size,
            operation,
            "backup created"
        );

        cache.records.push(record);
        sort_newest_first(&mut cache.records);
        self.enforce_retention(&mut cache);

        Ok(backup_id)
    }

    /// List records, newest first. Refreshes the metadata cache when its
    /// TTL has expired.
    pub fn list(&self, filter: &ListFilter) -> EngineResult<Vec<BackupRecord>> {
        self.refresh_if_stale()?;
        let cache = self.cache.read();

        let cutoff = filter
            .newer_than_hours
            .map(|h| Utc::now() - chrono::Duration::hours(h as i64));

        let mut out = Vec::new();
        for record in &cache.records {
            if let Some(ref op) = filter.operation {
                if &record.operation != op {
                    continue;
                }
            }
            if let Some(ref needle) = filter.path_substring {
                let hit = record
                    .files
                    .iter()
                    .any(|f| f.original_path.to_string_lossy().contains(needle.as_str()));
                if !hit {
                    continue;
                }
            }
            if let Some(cutoff) = cutoff {
                match record.created_at() {
                    Some(t) if t >= cutoff => {},
                    _ => continue,
                }
            }
            out.push(record.clone());
            if let Some(limit) = filter.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Fetch one record. `id` may be an exact backup id, the literal
    /// `latest`, or an unambiguous id prefix.
    pub fn get(&self, id: &str) -> EngineResult<BackupRecord> {
        self.refresh_if_stale()?;
        let cache = self.cache.read();
        resolve_record(&cache.records, id).cloned()
    }

    /// Restore files from a backup. With `specific_file`, only that entry
    /// is restored and its absence is an error. Without it, every entry is
    /// restored; per-file failures are collected as warnings and do not
    /// stop the rest.
    pub fn restore(
        &self,
        id: &str,
        specific_file: Option<&Path>,
        create_pre_restore_backup: bool,
    ) -> EngineResult<RestoreOutcome> {
        let record = self.get(id)?;

        let targets: Vec<&BackupFileEntry> = match specific_file {
            Some(path) => {
                let entry = record.entry_for(path).ok_or_else(|| {
                    EngineError::not_found(format!(
                        "{} is not part of backup {}",
                        path.display(),
                        record.backup_id
                    ))
                })?;
                vec![entry]
            },
            None => record.files.iter().collect(),
        };

        let pre_restore_backup = if create_pre_restore_backup {
            let existing: Vec<PathBuf> = targets
                .iter()
                .map(|e| e.original_path.clone())
                .filter(|p| p.exists())
                .collect();
            if existing.is_empty() {
                None
            } else {
                match self.create_batch(
                    &existing,
                    "pre-restore",
                    &format!("state before restoring {}", record.backup_id),
                ) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(error = %e, "pre-restore backup failed, continuing with restore");
                        None
                    },
                }
            }
        } else {
            None
        };

        let mut restored = Vec::new();
        let mut warnings = Vec::new();

        for entry in targets {
            let source = self.root.join(&record.backup_id).join(&entry.backup_path);
            let result = (|| -> EngineResult<()> {
                if let Some(parent) = entry.original_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&source, &entry.original_path)?;
                Ok(())
            })();

            match result {
                Ok(()) => restored.push(entry.original_path.clone()),
                Err(e) => {
                    let message = format!(
                        "failed to restore {}: {}",
                        entry.original_path.display(),
                        e
                    );
                    warn!("{message}");
                    warnings.push(message);
                },
            }
        }

        info!(
            backup_id = %record.backup_id,
            restored = restored.len(),
            failed = warnings.len(),
            "restore finished"
        );

        Ok(RestoreOutcome {
            backup_id: record.backup_id,
            restored,
            warnings,
            pre_restore_backup,
        })
    }

    /// Compare a backed-up file against its current on-disk state.
    pub fn compare(&self, id: &str, path: &Path) -> EngineResult<CompareReport> {
        let record = self.get(id)?;
        let entry = record.entry_for(path).ok_or_else(|| {
            EngineError::not_found(format!(
                "{} is not part of backup {}",
                path.display(),
                record.backup_id
            ))
        })?;

        let backup_content =
            fs::read_to_string(self.root.join(&record.backup_id).join(&entry.backup_path))?;
        let current_content = fs::read_to_string(path)?;

        let backup_lines = backup_content.lines().count();
        let current_lines = current_content.lines().count();

        let diff = similar::TextDiff::from_lines(&backup_content, &current_content);
        let mut changed_lines = 0usize;
        let mut first_differences = Vec::new();
        for change in diff.iter_all_changes() {
            let sign = match change.tag() {
                similar::ChangeTag::Delete => '-',
                similar::ChangeTag::Insert => '+',
                similar::ChangeTag::Equal => continue,
            };
            changed_lines += 1;
            if first_differences.len() < COMPARE_DISPLAY_CAP {
                first_differences.push(format!("{}{}", sign, change.value().trim_end_matches('\n')));
            }
        }

        Ok(CompareReport {
            backup_id: record.backup_id,
            file: path.to_path_buf(),
            backup_lines,
            current_lines,
            line_delta: current_lines as i64 - backup_lines as i64,
            changed_lines,
            identical: changed_lines == 0,
            first_differences,
        })
    }

    /// Delete whole records older than the cutoff. Retention always
    /// removes a record atomically by deleting its directory.
    pub fn cleanup(&self, older_than_days: u64, dry_run: bool) -> EngineResult<CleanupOutcome> {
        let mut cache = self.cache.write();
        self.refresh_locked(&mut cache)?;

        let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);
        let mut deleted_count = 0usize;
        let mut freed_bytes = 0u64;

        cache.records.retain(|record| {
            let expired = match record.created_at() {
                Some(t) => t < cutoff,
                // Unparseable timestamps are treated as expired.
                None => true,
            };
            if !expired {
                return true;
            }
            deleted_count += 1;
            freed_bytes += record.total_size;
            if !dry_run {
                let dir = self.root.join(&record.backup_id);
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!(backup_id = %record.backup_id, error = %e, "failed to delete expired backup");
                }
                return false;
            }
            true
        });

        debug!(deleted_count, freed_bytes, dry_run, "backup cleanup pass");
        Ok(CleanupOutcome {
            deleted_count,
            freed_bytes,
            dry_run,
        })
    }

    /// Age-based cleanup with the configured default retention window.
    pub fn cleanup_default(&self, dry_run: bool) -> EngineResult<CleanupOutcome> {
        self.cleanup(self.max_age_days, dry_run)
    }

    fn allocate_id(&self) -> EngineResult<String> {
        for _ in 0..1000 {
            let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
            let stamp = Local::now().format("%Y%m%d-%H%M%S");
            let mut hasher = Sha256::new();
            hasher.update(std::process::id().to_le_bytes());
            hasher.update(seq.to_le_bytes());
            hasher.update(
                Utc::now()
                    .timestamp_nanos_opt()
                    .unwrap_or_default()
                    .to_le_bytes(),
            );
            let digest = hasher.finalize();
            let suffix: String = digest[..3].iter().map(|b| format!("{b:02x}")).collect();
            let id = format!("{stamp}-{suffix}");
            if !self.root.join(&id).exists() {
                return Ok(id);
            }
        }
        Err(EngineError::Transient(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "could not allocate a unique backup id",
        )))
    }

    /// Stream-copy `from` to `to`, hashing while copying.
    fn copy_hashed(&self, from: &Path, to: &Path) -> EngineResult<String> {
        let mut reader = File::open(from)?;
        let mut writer = File::create(to)?;
        let mut hasher = Sha256::new();
        let mut slab = self.pool.acquire();

        loop {
            let read = reader.read(&mut slab)?;
            if read == 0 {
                break;
            }
            hasher.update(&slab[..read]);
            writer.write_all(&slab[..read])?;
        }
        writer.sync_all()?;
        self.pool.release(slab);

        Ok(format!("{:x}", hasher.finalize()))
    }

    fn refresh_if_stale(&self) -> EngineResult<()> {
        {
            let cache = self.cache.read();
            if let Some(at) = cache.refreshed_at {
                if at.elapsed() < self.ttl {
                    return Ok(());
                }
            }
        }
        let mut cache = self.cache.write();
        self.refresh_locked(&mut cache)
    }

    /// Rebuild the in-memory index from disk. Corrupt metadata is logged
    /// and the record skipped, so it behaves as `NotFound` for readers.
    fn refresh_locked(&self, cache: &mut MetadataCache) -> EngineResult<()> {
        let mut records = Vec::new();

        if self.root.exists() {
            for entry in fs::read_dir(&self.root)? {
                let Ok(entry) = entry else { continue };
                let metadata_path = entry.path().join(METADATA_FILE);
                if !metadata_path.is_file() {
                    continue;
                }
                let parsed: Result<BackupRecord, String> = fs::read_to_string(&metadata_path)
                    .map_err(|e| e.to_string())
                    .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()));
                match parsed {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(
                            path = %metadata_path.display(),
                            error = %e,
                            "corrupt backup metadata, treating record as missing"
                        );
                    },
                }
            }
        }

        sort_newest_first(&mut records);
        cache.records = records;
        cache.refreshed_at = Some(Instant::now());
        Ok(())
    }

    /// Count-based retention: after every create, the oldest records over
    /// `max_count` are deleted.
    fn enforce_retention(&self, cache: &mut MetadataCache) {
        while cache.records.len() > self.max_count {
            // records are newest first, so the victim is the last one
            let Some(victim) = cache.records.pop() else {
                break;
            };
            let dir = self.root.join(&victim.backup_id);
            info!(backup_id = %victim.backup_id, "retention removing oldest backup");
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(backup_id = %victim.backup_id, error = %e, "retention delete failed");
            }
        }
    }
}

fn sort_newest_first(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.backup_id.cmp(&a.backup_id)));
}

fn resolve_record<'a>(
    records: &'a [BackupRecord],
    id: &str,
) -> EngineResult<&'a BackupRecord> {
    if id == "latest" {
        return records
            .first()
            .ok_or_else(|| EngineError::not_found("no backups exist yet"));
    }

    if let Some(record) = records.iter().find(|r| r.backup_id == id) {
        return Ok(record);
    }

    let prefixed: Vec<&BackupRecord> = records
        .iter()
        .filter(|r| r.backup_id.starts_with(id))
        .collect();
    match prefixed.len() {
        0 => Err(EngineError::not_found(format!("backup '{id}'"))),
        1 => Ok(prefixed[0]),
        n => Err(EngineError::Ambiguous {
            reason: format!("backup id prefix '{id}' matches {n} records"),
        }),
    }
}

/// Pick a `files/` basename, disambiguating collisions with a numeric
/// suffix.
fn unique_basename(path: &Path, taken: &[String]) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    if !taken.iter().any(|t| t == &base) {
        return base;
    }
    for n in 1.. {
        let candidate = format!("{base}.{n}");
        if !taken.iter().any(|t| t == &candidate) {
            return candidate;
        }
    }
    unreachable!()
}

/// Hex SHA-256 of a file's bytes.
pub fn calculate_checksum(path: &Path) -> EngineResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(temp_dir: &TempDir) -> BackupManager {
        let config = BackupConfig {
            backup_dir: temp_dir.path().join("backups"),
            max_age_days: 7,
            max_count: 100,
            metadata_ttl_secs: 300,
        };
        BackupManager::new(&config, Arc::new(BufferPool::new(4)))
    }

    #[test]
    fn test_create_and_restore_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let file = temp_dir.path().join("data.txt");
        fs::write(&file, b"original bytes").unwrap();

        let id = mgr.create(&file, "edit", "before test edit").unwrap();

        fs::write(&file, b"mutated").unwrap();
        let outcome = mgr.restore(&id, None, false).unwrap();

        assert_eq!(outcome.restored, vec![file.clone()]);
        assert!(outcome.warnings.is_empty());
        assert_eq!(fs::read(&file).unwrap(), b"original bytes");
    }

    #[test]
    fn test_backup_id_format() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();

        let id = mgr.create(&file, "edit", "").unwrap();
        // YYYYMMDD-HHMMSS-xxxxxx
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_metadata_hash_matches_copy() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"hash me").unwrap();

        let id = mgr.create(&file, "edit", "").unwrap();
        let record = mgr.get(&id).unwrap();
        let entry = &record.files[0];

        let copy_path = mgr.root().join(&id).join(&entry.backup_path);
        assert_eq!(entry.hash, calculate_checksum(&copy_path).unwrap());
        assert_eq!(entry.hash, calculate_checksum(&file).unwrap());
    }

    #[test]
    fn test_batch_skips_unreadable_inputs() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let good = temp_dir.path().join("good.txt");
        fs::write(&good, b"ok").unwrap();
        let missing = temp_dir.path().join("missing.txt");

        let id = mgr
            .create_batch(&[good.clone(), missing], "batch", "")
            .unwrap();
        let record = mgr.get(&id).unwrap();
        assert_eq!(record.files.len(), 1);
        assert_eq!(record.files[0].original_path, good);
    }

    #[test]
    fn test_batch_fails_when_nothing_backed_up() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let missing = temp_dir.path().join("missing.txt");
        let result = mgr.create_batch(&[missing], "batch", "");
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
        // No partial record directory left behind.
        let leftover = fs::read_dir(mgr.root())
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_basename_collision_disambiguated() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let dir_a = temp_dir.path().join("a");
        let dir_b = temp_dir.path().join("b");
        fs::create_dir_all(&dir_a).unwrap();
        fs::create_dir_all(&dir_b).unwrap();
        fs::write(dir_a.join("same.txt"), b"first").unwrap();
        fs::write(dir_b.join("same.txt"), b"second").unwrap();

        let id = mgr
            .create_batch(
                &[dir_a.join("same.txt"), dir_b.join("same.txt")],
                "batch",
                "",
            )
            .unwrap();
        let record = mgr.get(&id).unwrap();
        assert_eq!(record.files.len(), 2);
        assert_ne!(record.files[0].backup_path, record.files[1].backup_path);

        // Both copies are intact and restorable.
        fs::write(dir_a.join("same.txt"), b"x").unwrap();
        fs::write(dir_b.join("same.txt"), b"x").unwrap();
        mgr.restore(&id, None, false).unwrap();
        assert_eq!(fs::read(dir_a.join("same.txt")).unwrap(), b"first");
        assert_eq!(fs::read(dir_b.join("same.txt")).unwrap(), b"second");
    }

    #[test]
    fn test_restore_specific_file_absent_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        let id = mgr.create(&file, "edit", "").unwrap();

        let other = temp_dir.path().join("other.txt");
        assert!(matches!(
            mgr.restore(&id, Some(&other), false),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_restore_creates_missing_parents() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let nested = temp_dir.path().join("deep/nested/file.txt");
        fs::create_dir_all(nested.parent().unwrap()).unwrap();
        fs::write(&nested, b"content").unwrap();
        let id = mgr.create(&nested, "edit", "").unwrap();

        fs::remove_dir_all(temp_dir.path().join("deep")).unwrap();
        let outcome = mgr.restore(&id, None, false).unwrap();
        assert_eq!(outcome.restored.len(), 1);
        assert_eq!(fs::read(&nested).unwrap(), b"content");
    }

    #[test]
    fn test_pre_restore_backup_captures_current_state() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"v1").unwrap();
        let id = mgr.create(&file, "edit", "").unwrap();

        fs::write(&file, b"v2").unwrap();
        let outcome = mgr.restore(&id, None, true).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"v1");

        // The pre-restore backup holds v2.
        let pre_id = outcome.pre_restore_backup.unwrap();
        mgr.restore(&pre_id, None, false).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"v2");
    }

    #[test]
    fn test_list_filters() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let a = temp_dir.path().join("alpha.txt");
        let b = temp_dir.path().join("beta.txt");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        mgr.create(&a, "edit", "").unwrap();
        mgr.create(&b, "pipeline", "").unwrap();

        let all = mgr.list(&ListFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let edits = mgr
            .list(&ListFilter {
                operation: Some("edit".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].operation, "edit");

        let betas = mgr
            .list(&ListFilter {
                path_substring: Some("beta".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(betas.len(), 1);

        let limited = mgr
            .list(&ListFilter {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);

        let recent = mgr
            .list(&ListFilter {
                newer_than_hours: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn test_get_latest_and_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        let first = mgr.create(&file, "edit", "").unwrap();
        let second = mgr.create(&file, "edit", "").unwrap();

        assert_eq!(mgr.get("latest").unwrap().backup_id, second);
        // A full id works as its own prefix.
        assert_eq!(mgr.get(&first).unwrap().backup_id, first);

        assert!(matches!(
            mgr.get("nonexistent-id"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_retention_removes_oldest_over_max() {
        let temp_dir = TempDir::new().unwrap();
        let config = BackupConfig {
            backup_dir: temp_dir.path().join("backups"),
            max_age_days: 7,
            max_count: 2,
            metadata_ttl_secs: 300,
        };
        let mgr = BackupManager::new(&config, Arc::new(BufferPool::new(4)));

        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();

        let first = mgr.create(&file, "edit", "").unwrap();
        let _second = mgr.create(&file, "edit", "").unwrap();
        let _third = mgr.create(&file, "edit", "").unwrap();

        let records = mgr.list(&ListFilter::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.backup_id != first));
        assert!(!mgr.root().join(&first).exists());
    }

    #[test]
    fn test_cleanup_by_age_dry_run() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        let id = mgr.create(&file, "edit", "").unwrap();

        // Nothing is old enough yet.
        let outcome = mgr.cleanup(1, false).unwrap();
        assert_eq!(outcome.deleted_count, 0);

        // Zero-day cutoff expires everything; dry run keeps the files.
        let outcome = mgr.cleanup(0, true).unwrap();
        assert_eq!(outcome.deleted_count, 1);
        assert!(mgr.root().join(&id).exists());

        let outcome = mgr.cleanup(0, false).unwrap();
        assert_eq!(outcome.deleted_count, 1);
        assert!(!mgr.root().join(&id).exists());
    }

    #[test]
    fn test_corrupt_metadata_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        let good = mgr.create(&file, "edit", "").unwrap();

        // Plant a corrupt record.
        let bad_dir = mgr.root().join("20200101-000000-abcdef");
        fs::create_dir_all(&bad_dir).unwrap();
        fs::write(bad_dir.join(METADATA_FILE), b"{not json").unwrap();

        // Force a refresh by constructing a fresh manager over the store.
        let config = BackupConfig {
            backup_dir: mgr.root().to_path_buf(),
            max_age_days: 7,
            max_count: 100,
            metadata_ttl_secs: 300,
        };
        let fresh = BackupManager::new(&config, Arc::new(BufferPool::new(4)));
        let records = fresh.list(&ListFilter::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].backup_id, good);
        assert!(matches!(
            fresh.get("20200101-000000-abcdef"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_compare_reports_differences() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir);

        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "one\ntwo\nthree\n").unwrap();
        let id = mgr.create(&file, "edit", "").unwrap();

        let same = mgr.compare(&id, &file).unwrap();
        assert!(same.identical);
        assert_eq!(same.line_delta, 0);

        fs::write(&file, "one\nTWO\nthree\nfour\n").unwrap();
        let report = mgr.compare(&id, &file).unwrap();
        assert!(!report.identical);
        assert_eq!(report.backup_lines, 3);
        assert_eq!(report.current_lines, 4);
        assert_eq!(report.line_delta, 1);
        assert!(report.first_differences.iter().any(|l| l == "-two"));
        assert!(report.first_differences.iter().any(|l| l == "+TWO"));
        assert!(report.first_differences.iter().any(|l| l == "+four"));
    }
}
