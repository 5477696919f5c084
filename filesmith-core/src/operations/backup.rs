use crate::backup::{
    BackupRecord, CleanupOutcome, CompareReport, ListFilter, RestoreOutcome,
};
use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::EngineResult;
use std::path::{Path, PathBuf};

/// Snapshot one or more files into a new backup record.
pub fn create_backup_operation(
    engine: &Engine,
    paths: &[PathBuf],
    user_context: &str,
    cancel: &CancellationToken,
) -> EngineResult<String> {
    let _permit = engine.semaphore.acquire(cancel)?;
    let validated: Vec<PathBuf> = paths
        .iter()
        .map(|p| engine.guard.validate(p))
        .collect::<EngineResult<_>>()?;
    let id = engine
        .backups
        .create_batch(&validated, "manual", user_context)?;
    engine.telemetry.record_backup();
    Ok(id)
}

/// List backup records, newest first.
pub fn list_backups_operation(
    engine: &Engine,
    filter: &ListFilter,
    cancel: &CancellationToken,
) -> EngineResult<Vec<BackupRecord>> {
    let _permit = engine.semaphore.acquire(cancel)?;
    let mut filter = filter.clone();
    let cap = engine.config.limits.max_list_items;
    filter.limit = Some(filter.limit.map_or(cap, |l| l.min(cap)));
    engine.backups.list(&filter)
}

/// Restore a backup, optionally a single file from it.
pub fn restore_backup_operation(
    engine: &Engine,
    backup_id: &str,
    specific_file: Option<&Path>,
    create_pre_restore_backup: bool,
    cancel: &CancellationToken,
) -> EngineResult<RestoreOutcome> {
    let _permit = engine.semaphore.acquire(cancel)?;
    let specific_file = specific_file
        .map(|p| engine.guard.validate(p))
        .transpose()?;
    let outcome = engine
        .backups
        .restore(backup_id, specific_file.as_deref(), create_pre_restore_backup)?;
    for path in &outcome.restored {
        engine.cache.invalidate(path);
        engine.notify_sync(path);
    }
    Ok(outcome)
}

/// Diff a backed-up file against its current on-disk state.
pub fn compare_backup_operation(
    engine: &Engine,
    backup_id: &str,
    path: &Path,
    cancel: &CancellationToken,
) -> EngineResult<CompareReport> {
    let _permit = engine.semaphore.acquire(cancel)?;
    let path = engine.guard.validate(path)?;
    engine.backups.compare(backup_id, &path)
}

/// Delete backups older than the cutoff.
pub fn cleanup_backups_operation(
    engine: &Engine,
    older_than_days: Option<u64>,
    dry_run: bool,
    cancel: &CancellationToken,
) -> EngineResult<CleanupOutcome> {
    let _permit = engine.semaphore.acquire(cancel)?;
    match older_than_days {
        Some(days) => engine.backups.cleanup(days, dry_run),
        None => engine.backups.cleanup_default(dry_run),
    }
}
