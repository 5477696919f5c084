use crate::atomic::write_atomic;
use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::hooks::{EditEvent, HookDecision};
use crate::impact::{analyze_change, is_blocked, render_risk_warning, ChangeImpact};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Files over this size never go through the flexible-regex fallback.
const FLEXIBLE_REGEX_MAX_CONTENT: usize = 100 * 1024;

/// Match quality of an applied edit, ordered worst to best.
///
/// `High` means an exact or whitespace-trimmed exact match, `Medium` a
/// line-wise or multiline-trimmed match, `Low` the flexible whitespace
/// regex fallback (which can match text the caller did not anticipate).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(name)
    }
}

/// Outcome of the matching algorithm alone, before anything is written.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub content: String,
    pub replacement_count: usize,
    pub confidence: Confidence,
    /// Distinct source lines intersecting any replaced range.
    pub lines_affected: usize,
}

/// Result of a completed `edit` call. `modified_content` is the full new
/// file content as written.
#[derive(Debug, Clone, Serialize)]
pub struct EditResult {
    pub path: std::path::PathBuf,
    pub replacement_count: usize,
    pub match_confidence: Confidence,
    pub lines_affected: usize,
    pub backup_id: Option<String>,
    pub risk: ChangeImpact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_content: Option<String>,
}

/// Normalize line endings to LF for matching and comparison.
pub fn normalize_newlines(s: &str) -> Cow<'_, str> {
    if s.contains('\r') {
        Cow::Owned(s.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(s)
    }
}

/// Apply a single find/replace to one file under the full safety sequence:
/// guard, structural checks, context validation, risk gate, pre-hook,
/// backup, intelligent edit, atomic write, cache invalidation, post-hook,
/// auto-sync.
pub fn edit_file(
    engine: &Engine,
    path: &Path,
    old_text: &str,
    new_text: &str,
    force: bool,
    cancel: &CancellationToken,
) -> EngineResult<EditResult> {
    let path = engine.guard.validate(path)?;
    let metadata = std::fs::metadata(&path).map_err(|_| EngineError::NotFound {
        what: path.display().to_string(),
    })?;
    if metadata.is_dir() {
        return Err(EngineError::IsDirectory { path });
    }
    if !metadata.is_file() {
        return Err(EngineError::NotAFile { path });
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
    let content = normalize_newlines(&content).into_owned();
    let old_text_norm = normalize_newlines(old_text);
    let new_text_norm = normalize_newlines(new_text);

    if !validate_context(&content, &old_text_norm) {
        return Err(EngineError::StaleContext { path });
    }

    let impact = analyze_change(&content, &old_text_norm, &new_text_norm, &engine.config.risk);
    if is_blocked(&impact, force) {
        return Err(EngineError::Blocked {
            warning: render_risk_warning(&impact, &path.display().to_string()),
        });
    }

    let event = EditEvent {
        path: &path,
        operation: "edit_file",
        old_len: old_text.len(),
        new_len: new_text.len(),
        risk_level: impact.risk_level,
    };
    let override_content = if engine.config.hooks.enabled {
        match engine.hooks.pre_edit(&event) {
            HookDecision::Allow => None,
            HookDecision::Deny(reason) => return Err(EngineError::HookDenied { reason }),
            HookDecision::Override(content) => Some(content),
        }
    } else {
        None
    };

    cancel.checkpoint()?;

    let backup_id = engine.backups.create(
        &path,
        "edit_file",
        &format!(
            "replace {} occurrence(s), {:.1}% of file",
            impact.occurrences, impact.change_percentage
        ),
    )?;
    engine.telemetry.record_backup();

    let outcome = apply_smart_edit(&content, &old_text_norm, &new_text_norm)
        .ok_or_else(|| EngineError::NoMatch { path: path.clone() })?;

    let final_content = override_content.unwrap_or_else(|| outcome.content.clone());
    write_atomic(&path, final_content.as_bytes())?;

    engine.cache.invalidate(&path);
    if engine.config.hooks.enabled {
        engine.hooks.post_edit(&event);
    }
    engine.notify_sync(&path);
    engine.telemetry.record_edit(old_text.len(), new_text.len());

    debug!(
        path = %path.display(),
        replacements = outcome.replacement_count,
        confidence = %outcome.confidence,
        backup_id = %backup_id,
        "edit applied"
    );

    Ok(EditResult {
        path,
        replacement_count: outcome.replacement_count,
        match_confidence: outcome.confidence,
        lines_affected: outcome.lines_affected,
        backup_id: Some(backup_id),
        risk: impact,
        modified_content: Some(final_content),
    })
}

/// Context validation: the text the caller wants to modify should still
/// sit in roughly the surroundings the caller last saw.
///
/// A multi-line `old_text` anchors on its first non-blank line; if that
/// anchor is gone from the file, the caller is editing from a stale read.
/// A single-line `old_text` carries no surrounding context, so it flows
/// straight to the matching algorithm (absence there is `NoMatch`).
pub fn validate_context(content: &str, old_text: &str) -> bool {
    if !old_text.contains('\n') {
        return true;
    }
    if content.contains(old_text) {
        return true;
    }
    let Some(anchor) = old_text.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return true;
    };
    content.lines().any(|line| line.trim().contains(anchor))
}

/// The intelligent-edit algorithm: staged matching strategies, strongest
/// first. Inputs are LF-normalized. Returns `None` when nothing matched.
pub fn apply_smart_edit(content: &str, old_text: &str, new_text: &str) -> Option<EditOutcome> {
    if old_text.is_empty() {
        return None;
    }

    // 1. Exact substring match.
    if let Some((out, count, lines)) = replace_all_tracking(content, old_text, new_text) {
        return Some(EditOutcome {
            content: out,
            replacement_count: count,
            confidence: Confidence::High,
            lines_affected: lines,
        });
    }

    // 2. Whitespace-trimmed match.
    let normalized_old = old_text.trim();
    if !normalized_old.is_empty() && normalized_old != old_text {
        if let Some((out, count, lines)) =
            replace_all_tracking(content, normalized_old, new_text)
        {
            return Some(EditOutcome {
                content: out,
                replacement_count: count,
                confidence: Confidence::High,
                lines_affected: lines,
            });
        }
    }

    // 3. Line-by-line scan: containment, whole-line trimmed equality
    // (reindented), trimmed containment. First hit wins per line.
    if let Some(outcome) = line_scan_replace(content, old_text, normalized_old, new_text) {
        return Some(outcome);
    }

    // 4. Multiline match on trimmed line sequences.
    if old_text.contains('\n') {
        if let Some(outcome) = multiline_trimmed_replace(content, old_text, new_text) {
            return Some(outcome);
        }
    }

    // 5. Flexible whitespace regex, only for bounded content sizes.
    if content.len() < FLEXIBLE_REGEX_MAX_CONTENT {
        if let Some(outcome) = flexible_regex_replace(content, old_text, new_text) {
            return Some(outcome);
        }
    }

    None
}

/// Count newlines in a byte slice.
fn newline_count(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b == b'\n').count()
}

/// Replace every occurrence of `needle`, tracking the replacement count
/// and the set of source lines any replaced range intersects. Returns
/// `None` when there is no occurrence.
fn replace_all_tracking(
    content: &str,
    needle: &str,
    replacement: &str,
) -> Option<(String, usize, usize)> {
    if needle.is_empty() || !content.contains(needle) {
        return None;
    }

    let bytes = content.as_bytes();
    let grow = replacement.len().saturating_sub(needle.len());
    let mut out = String::with_capacity(content.len() + grow * 4);
    let mut lines: BTreeSet<usize> = BTreeSet::new();
    let mut count = 0usize;
    let mut cursor = 0usize;
    let mut line_at_cursor = 0usize;

    while let Some(rel) = content[cursor..].find(needle) {
        let start = cursor + rel;
        let end = start + needle.len();

        line_at_cursor += newline_count(&bytes[cursor..start]);
        let inner = newline_count(&bytes[start..end]);
        // A range ending exactly on a newline does not touch the next line.
        let last_line = if inner > 0 && bytes[end - 1] == b'\n' {
            line_at_cursor + inner - 1
        } else {
            line_at_cursor + inner
        };
        for line in line_at_cursor..=last_line {
            lines.insert(line);
        }

        out.push_str(&content[cursor..start]);
        out.push_str(replacement);
        line_at_cursor += inner;
        cursor = end;
        count += 1;
    }
    out.push_str(&content[cursor..]);

    Some((out, count, lines.len()))
}

fn line_scan_replace(
    content: &str,
    old_text: &str,
    normalized_old: &str,
    new_text: &str,
) -> Option<EditOutcome> {
    let mut replaced_lines = 0usize;
    let mut count = 0usize;
    let mut out = String::with_capacity(content.len());
    let mut first = true;

    for line in content.split('\n') {
        if !first {
            out.push('\n');
        }
        first = false;

        if !old_text.is_empty() && line.contains(old_text) {
            count += occurrences_in(line, old_text);
            out.push_str(&line.replace(old_text, new_text));
            replaced_lines += 1;
        } else if !normalized_old.is_empty() && line.trim() == normalized_old {
            // Whole-line replacement keeps the original indentation.
            let indent: String = line
                .chars()
                .take_while(|c| c.is_whitespace())
                .collect();
            out.push_str(&indent);
            out.push_str(new_text.trim());
            count += 1;
            replaced_lines += 1;
        } else if !normalized_old.is_empty() && line.contains(normalized_old) {
            count += occurrences_in(line, normalized_old);
            out.push_str(&line.replace(normalized_old, new_text));
            replaced_lines += 1;
        } else {
            out.push_str(line);
        }
    }

    if count == 0 {
        return None;
    }
    Some(EditOutcome {
        content: out,
        replacement_count: count,
        confidence: Confidence::Medium,
        lines_affected: replaced_lines,
    })
}

/// Match `old_text`'s lines against windows of content lines by trimmed
/// equality, replacing each non-overlapping window with `new_text`.
fn multiline_trimmed_replace(
    content: &str,
    old_text: &str,
    new_text: &str,
) -> Option<EditOutcome> {
    let old_lines: Vec<&str> = old_text.lines().map(str::trim).collect();
    if old_lines.is_empty() {
        return None;
    }
    let content_lines: Vec<&str> = content.split('\n').collect();
    if content_lines.len() < old_lines.len() {
        return None;
    }

    let mut out_lines: Vec<String> = Vec::with_capacity(content_lines.len());
    let mut count = 0usize;
    let mut lines_affected = 0usize;
    let mut i = 0usize;

    while i < content_lines.len() {
        let window_fits = i + old_lines.len() <= content_lines.len();
        let matches = window_fits
            && old_lines
                .iter()
                .enumerate()
                .all(|(j, old)| content_lines[i + j].trim() == *old);

        if matches {
            for replacement_line in new_text.split('\n') {
                out_lines.push(replacement_line.to_string());
            }
            count += 1;
            lines_affected += old_lines.len();
            i += old_lines.len();
        } else {
            out_lines.push(content_lines[i].to_string());
            i += 1;
        }
    }

    if count == 0 {
        return None;
    }
    Some(EditOutcome {
        content: out_lines.join("\n"),
        replacement_count: count,
        confidence: Confidence::Medium,
        lines_affected,
    })
}

/// Build the flexible fallback pattern: literal text with runs of spaces
/// matching any whitespace and newlines tolerating surrounding drift.
fn flexible_pattern(old_text: &str) -> String {
    let mut pattern = String::with_capacity(old_text.len() * 2);
    let mut chars = old_text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ' ' => {
                while chars.peek() == Some(&' ') {
                    chars.next();
                }
                pattern.push_str(r"\s+");
            },
            '\n' => pattern.push_str(r"\s*\n\s*"),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern
}

fn flexible_regex_replace(
    content: &str,
    old_text: &str,
    new_text: &str,
) -> Option<EditOutcome> {
    let pattern = flexible_pattern(old_text);
    let re = regex::Regex::new(&pattern).ok()?;

    let matches: Vec<(usize, usize)> = re
        .find_iter(content)
        .map(|m| (m.start(), m.end()))
        .collect();
    if matches.is_empty() {
        return None;
    }

    let bytes = content.as_bytes();
    let mut lines: BTreeSet<usize> = BTreeSet::new();
    for &(start, end) in &matches {
        let first_line = newline_count(&bytes[..start]);
        let inner = newline_count(&bytes[start..end]);
        let last_line = if inner > 0 && bytes[end - 1] == b'\n' {
            first_line + inner - 1
        } else {
            first_line + inner
        };
        for line in first_line..=last_line {
            lines.insert(line);
        }
    }

    // The replacement is literal text, not a capture template.
    let out = re
        .replace_all(content, regex::NoExpand(new_text))
        .into_owned();

    Some(EditOutcome {
        content: out,
        replacement_count: matches.len(),
        confidence: Confidence::Low,
        lines_affected: lines.len(),
    })
}

fn occurrences_in(haystack: &str, needle: &str) -> usize {
    crate::impact::count_occurrences(haystack, needle)
}
