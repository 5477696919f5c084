use crate::atomic::write_atomic;
use crate::cancel::CancellationToken;
use crate::edit::{apply_smart_edit, normalize_newlines, Confidence};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One find/replace pair inside a multi-edit request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditPair {
    pub old_text: String,
    pub new_text: String,
}

/// What happened to one pair.
#[derive(Debug, Clone, Serialize)]
pub struct EditAttempt {
    pub index: usize,
    pub success: bool,
    pub replacement_count: usize,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a multi-edit: one read, one backup, one atomic write.
#[derive(Debug, Clone, Serialize)]
pub struct MultiEditResult {
    pub path: PathBuf,
    pub total: usize,
    pub successful: usize,
    /// High when every edit matched cleanly; degrades to Medium when any
    /// edit was low-confidence or failed; None when nothing was written.
    pub confidence: Confidence,
    pub lines_affected: usize,
    pub backup_id: Option<String>,
    pub attempts: Vec<EditAttempt>,
}

/// Apply an ordered list of edits to one file. Each successive edit sees
/// the output of the previous one. Per-edit failures are recorded and
/// skipped; if zero edits succeed the file is not rewritten.
pub fn multi_edit_file(
    engine: &Engine,
    path: &Path,
    edits: &[EditPair],
    cancel: &CancellationToken,
) -> EngineResult<MultiEditResult> {
    let path = engine.guard.validate(path)?;
    let metadata = std::fs::metadata(&path).map_err(|_| EngineError::NotFound {
        what: path.display().to_string(),
    })?;
    if metadata.is_dir() {
        return Err(EngineError::IsDirectory { path });
    }
    let limit = engine.config.limits.edit_max_file_size;
    if metadata.len() > limit {
        return Err(EngineError::TooLarge {
            path,
            size: metadata.len(),
            limit,
        });
    }
    if edits.is_empty() {
        return Err(EngineError::Ambiguous {
            reason: "multi_edit requires at least one edit".to_string(),
        });
    }

    cancel.checkpoint()?;

    // Single read.
    let raw = engine.cache.read(&path)?;
    let original = String::from_utf8((*raw).clone()).map_err(|_| EngineError::NotAFile {
        path: path.clone(),
    })?;
    let original = normalize_newlines(&original).into_owned();

    // Single backup, taken before any mutation.
    let backup_id = engine.backups.create(
        &path,
        "multi_edit",
        &format!("{} edit(s)", edits.len()),
    )?;
    engine.telemetry.record_backup();

    let mut content = original.clone();
    let mut attempts = Vec::with_capacity(edits.len());
    let mut successful = 0usize;
    let mut lines_affected = 0usize;
    let mut confidence = Confidence::High;

    for (index, pair) in edits.iter().enumerate() {
        cancel.checkpoint()?;

        if pair.old_text.is_empty() {
            attempts.push(EditAttempt {
                index,
                success: false,
                replacement_count: 0,
                confidence: Confidence::None,
                error: Some("old_text is empty".to_string()),
            });
            confidence = confidence.min(Confidence::Medium);
            continue;
        }

        let old_norm = normalize_newlines(&pair.old_text);
        let new_norm = normalize_newlines(&pair.new_text);

        match apply_smart_edit(&content, &old_norm, &new_norm) {
            Some(outcome) => {
                content = outcome.content;
                successful += 1;
                lines_affected += outcome.lines_affected;
                if outcome.confidence <= Confidence::Low {
                    confidence = confidence.min(Confidence::Medium);
                }
                engine
                    .telemetry
                    .record_edit(pair.old_text.len(), pair.new_text.len());
                attempts.push(EditAttempt {
                    index,
                    success: true,
                    replacement_count: outcome.replacement_count,
                    confidence: outcome.confidence,
                    error: None,
                });
            },
            None => {
                confidence = confidence.min(Confidence::Medium);
                attempts.push(EditAttempt {
                    index,
                    success: false,
                    replacement_count: 0,
                    confidence: Confidence::None,
                    error: Some(format!(
                        "no match found for edit #{index} in {}",
                        path.display()
                    )),
                });
            },
        }
    }

    if successful == 0 {
        // Nothing matched: the file stays untouched and every error is
        // surfaced to the caller.
        return Ok(MultiEditResult {
            path,
            total: edits.len(),
            successful: 0,
            confidence: Confidence::None,
            lines_affected: 0,
            backup_id: Some(backup_id),
            attempts,
        });
    }

    write_atomic(&path, content.as_bytes())?;
    engine.cache.invalidate(&path);
    engine.notify_sync(&path);

    debug!(
        path = %path.display(),
        total = edits.len(),
        successful,
        "multi-edit applied"
    );

    Ok(MultiEditResult {
        path,
        total: edits.len(),
        successful,
        confidence,
        lines_affected,
        backup_id: Some(backup_id),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::fs;
    use tempfile::TempDir;

    fn engine_for(temp_dir: &TempDir) -> Engine {
        let mut config = EngineConfig::default();
        config.allowed_paths = vec![temp_dir.path().to_path_buf()];
        config.backup.backup_dir = temp_dir.path().join(".backups");
        config.parallel_ops = 2;
        Engine::new(config).unwrap()
    }

    fn pairs(list: &[(&str, &str)]) -> Vec<EditPair> {
        list.iter()
            .map(|(old, new)| EditPair {
                old_text: (*old).to_string(),
                new_text: (*new).to_string(),
            })
            .collect()
    }

    #[test]
    fn test_ordered_edits_single_write() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("cfg.txt");
        fs::write(&file, "a=1;b=2;c=3;").unwrap();

        let cancel = CancellationToken::new();
        let result = multi_edit_file(
            &engine,
            &file,
            &pairs(&[("a=1", "a=10"), ("c=3", "c=30")]),
            &cancel,
        )
        .unwrap();

        assert_eq!(fs::read_to_string(&file).unwrap(), "a=10;b=2;c=30;");
        assert_eq!(result.total, 2);
        assert_eq!(result.successful, 2);
        assert_eq!(result.confidence, Confidence::High);

        // Exactly one backup for the whole batch, restoring the original.
        let backups = engine
            .backups
            .list(&crate::backup::ListFilter::default())
            .unwrap();
        assert_eq!(backups.len(), 1);
        engine
            .backups
            .restore(&result.backup_id.unwrap(), None, false)
            .unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "a=1;b=2;c=3;");
    }

    #[test]
    fn test_later_edit_sees_earlier_output() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("chain.txt");
        fs::write(&file, "start").unwrap();

        let cancel = CancellationToken::new();
        let result = multi_edit_file(
            &engine,
            &file,
            &pairs(&[("start", "middle"), ("middle", "end")]),
            &cancel,
        )
        .unwrap();

        assert_eq!(result.successful, 2);
        assert_eq!(fs::read_to_string(&file).unwrap(), "end");
    }

    #[test]
    fn test_failed_edit_recorded_and_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("partial.txt");
        fs::write(&file, "keep this value").unwrap();

        let cancel = CancellationToken::new();
        let result = multi_edit_file(
            &engine,
            &file,
            &pairs(&[("missing", "x"), ("value", "number"), ("", "y")]),
            &cancel,
        )
        .unwrap();

        assert_eq!(result.total, 3);
        assert_eq!(result.successful, 1);
        assert_eq!(result.confidence, Confidence::Medium);
        assert_eq!(fs::read_to_string(&file).unwrap(), "keep this number");

        assert!(!result.attempts[0].success);
        assert!(result.attempts[1].success);
        assert!(!result.attempts[2].success);
        assert!(result.attempts[2]
            .error
            .as_deref()
            .unwrap()
            .contains("empty"));
    }

    #[test]
    fn test_zero_successes_leaves_file_unwritten() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("untouched.txt");
        fs::write(&file, "original").unwrap();
        let before_mtime = fs::metadata(&file).unwrap().modified().unwrap();

        let cancel = CancellationToken::new();
        let result = multi_edit_file(
            &engine,
            &file,
            &pairs(&[("nope", "x"), ("also nope", "y")]),
            &cancel,
        )
        .unwrap();

        assert_eq!(result.successful, 0);
        assert_eq!(result.confidence, Confidence::None);
        assert_eq!(fs::read_to_string(&file).unwrap(), "original");
        assert_eq!(
            fs::metadata(&file).unwrap().modified().unwrap(),
            before_mtime
        );
        assert!(result.attempts.iter().all(|a| !a.success));
    }

    #[test]
    fn test_singleton_multi_edit_matches_plain_edit() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);

        let multi_file = temp_dir.path().join("a.txt");
        let single_file = temp_dir.path().join("b.txt");
        fs::write(&multi_file, "alpha beta alpha").unwrap();
        fs::write(&single_file, "alpha beta alpha").unwrap();

        let cancel = CancellationToken::new();
        let multi = multi_edit_file(&engine, &multi_file, &pairs(&[("alpha", "X")]), &cancel)
            .unwrap();
        let single =
            crate::edit::edit_file(&engine, &single_file, "alpha", "X", false, &cancel).unwrap();

        assert_eq!(
            fs::read_to_string(&multi_file).unwrap(),
            fs::read_to_string(&single_file).unwrap()
        );
        assert_eq!(
            multi.attempts[0].replacement_count,
            single.replacement_count
        );
        assert_eq!(multi.confidence, single.match_confidence);
    }

    #[test]
    fn test_empty_edit_list_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();

        let cancel = CancellationToken::new();
        assert!(matches!(
            multi_edit_file(&engine, &file, &[], &cancel),
            Err(EngineError::Ambiguous { .. })
        ));
    }
}
