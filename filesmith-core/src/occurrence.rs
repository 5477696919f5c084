use crate::atomic::write_atomic;
use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Result of a targeted nth-occurrence replacement.
#[derive(Debug, Clone, Serialize)]
pub struct ReplaceNthResult {
    pub path: PathBuf,
    pub total_occurrences: usize,
    /// 1-based index of the occurrence that was replaced, counted from
    /// the start of the file.
    pub replaced_index: usize,
    pub line_number: u64,
    pub backup_id: String,
}

/// Replace exactly one occurrence of `pattern`.
///
/// `occurrence` counts forward from 1; negative values count from the
/// end (-1 is the last match, -k the kth-from-last). Zero is an error,
/// as is an ordinal beyond the number of matches.
pub fn replace_nth_occurrence(
    engine: &Engine,
    path: &Path,
    pattern: &str,
    replacement: &str,
    occurrence: i64,
    cancel: &CancellationToken,
) -> EngineResult<ReplaceNthResult> {
    if occurrence == 0 {
        return Err(EngineError::Ambiguous {
            reason: "occurrence 0 is not a position; use 1..n forward or -1..-k from the end"
                .to_string(),
        });
    }
    if pattern.is_empty() {
        return Err(EngineError::Ambiguous {
            reason: "pattern must not be empty".to_string(),
        });
    }

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

    cancel.checkpoint()?;

    let raw = engine.cache.read(&path)?;
    let content = String::from_utf8((*raw).clone()).map_err(|_| EngineError::NotAFile {
        path: path.clone(),
    })?;

    let ranges = find_ranges(&content, pattern);
    if ranges.is_empty() {
        return Err(EngineError::NoMatch { path });
    }

    let index = if occurrence > 0 {
        (occurrence - 1) as usize
    } else {
        let from_end = occurrence.unsigned_abs() as usize;
        if from_end > ranges.len() {
            return Err(EngineError::Ambiguous {
                reason: format!(
                    "occurrence {occurrence} is out of range: only {} match(es) in {}",
                    ranges.len(),
                    path.display()
                ),
            });
        }
        ranges.len() - from_end
    };

    let Some(&(start, end)) = ranges.get(index) else {
        return Err(EngineError::Ambiguous {
            reason: format!(
                "occurrence {occurrence} is out of range: only {} match(es) in {}",
                ranges.len(),
                path.display()
            ),
        });
    };

    let backup_id = engine.backups.create(
        &path,
        "replace_nth_occurrence",
        &format!("occurrence {occurrence} of {} match(es)", ranges.len()),
    )?;
    engine.telemetry.record_backup();
    engine.telemetry.record_edit(pattern.len(), replacement.len());

    let mut modified = String::with_capacity(content.len());
    modified.push_str(&content[..start]);
    modified.push_str(replacement);
    modified.push_str(&content[end..]);

    write_atomic(&path, modified.as_bytes())?;
    engine.cache.invalidate(&path);
    engine.notify_sync(&path);

    let line_number = content[..start].matches('\n').count() as u64 + 1;

    Ok(ReplaceNthResult {
        path,
        total_occurrences: ranges.len(),
        replaced_index: index + 1,
        line_number,
        backup_id,
    })
}

/// Ordered, non-overlapping match ranges. The pattern is tried as a
/// regex first; an invalid regex falls back to literal substring search.
pub fn find_ranges(content: &str, pattern: &str) -> Vec<(usize, usize)> {
    if let Ok(re) = regex::Regex::new(pattern) {
        return re
            .find_iter(content)
            .filter(|m| !m.is_empty())
            .map(|m| (m.start(), m.end()))
            .collect();
    }

    let mut ranges = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = content[cursor..].find(pattern) {
        let start = cursor + rel;
        ranges.push((start, start + pattern.len()));
        cursor = start + pattern.len();
    }
    ranges
}
