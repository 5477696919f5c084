use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::processor::{process, ProcessingConfig, ProcessingMode, UnitInfo};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One pattern in a transform request. `limit <= 0` means unbounded;
/// otherwise only the first `limit` matches are replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSpec {
    pub pattern: String,
    pub replacement: String,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub multiline: bool,
    #[serde(default)]
    pub limit: i64,
}

/// How a pattern list composes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransformMode {
    /// Each pattern is applied to the output of the previous one.
    #[default]
    Sequential,
    /// Composition by declaration order over the original text: matches
    /// are collected per pattern against the pre-transform state, and
    /// later patterns take precedence on overlap.
    Parallel,
}

/// Result of a regex transform over one file.
#[derive(Debug, Clone, Serialize)]
pub struct TransformResult {
    pub path: PathBuf,
    pub patterns_applied: usize,
    pub total_replacements: usize,
    pub transformed: bool,
    pub backup_id: Option<String>,
    pub dry_run: bool,
}

/// Compile a pattern, prepending `(?i)` / `(?s)` unless the pattern
/// already carries an inline flag group.
pub fn compile_pattern(spec: &PatternSpec) -> EngineResult<Regex> {
    let already_flagged = spec.pattern.starts_with("(?");
    let mut flags = String::new();
    if !already_flagged {
        if spec.case_insensitive {
            flags.push('i');
        }
        if spec.multiline {
            flags.push('s');
        }
    }
    let pattern = if flags.is_empty() {
        spec.pattern.clone()
    } else {
        format!("(?{flags}){}", spec.pattern)
    };

    Regex::new(&pattern).map_err(|e| EngineError::InvalidPattern {
        pattern: spec.pattern.clone(),
        reason: e.to_string(),
    })
}

/// Apply a compiled pattern list to a byte buffer, honoring per-pattern
/// limits. Returns the new bytes and the number of replacements.
pub fn apply_patterns(
    content: &[u8],
    compiled: &[(Regex, &PatternSpec)],
    mode: TransformMode,
    remaining: &mut [Option<usize>],
) -> (Vec<u8>, usize) {
    match mode {
        TransformMode::Sequential => apply_sequential(content, compiled, remaining),
        TransformMode::Parallel => apply_parallel(content, compiled, remaining),
    }
}

fn budget_for(remaining: &mut [Option<usize>], index: usize) -> usize {
    match remaining.get(index).copied().flatten() {
        Some(left) => left,
        None => usize::MAX,
    }
}

fn consume_budget(remaining: &mut [Option<usize>], index: usize, used: usize) {
    if let Some(Some(left)) = remaining.get_mut(index) {
        *left = left.saturating_sub(used);
    }
}

fn apply_sequential(
    content: &[u8],
    compiled: &[(Regex, &PatternSpec)],
    remaining: &mut [Option<usize>],
) -> (Vec<u8>, usize) {
    let mut current = content.to_vec();
    let mut total = 0usize;

    for (index, (re, spec)) in compiled.iter().enumerate() {
        let budget = budget_for(remaining, index);
        if budget == 0 {
            continue;
        }
        let hits = re.find_iter(&current).take(budget).count();
        if hits == 0 {
            continue;
        }
        current = re
            .replacen(&current, hits, spec.replacement.as_bytes())
            .into_owned();
        consume_budget(remaining, index, hits);
        total += hits;
    }

    (current, total)
}

fn apply_parallel(
    content: &[u8],
    compiled: &[(Regex, &PatternSpec)],
    remaining: &mut [Option<usize>],
) -> (Vec<u8>, usize) {
    // (start, end, expanded replacement, pattern index)
    let mut picks: Vec<(usize, usize, Vec<u8>, usize)> = Vec::new();

    for (index, (re, spec)) in compiled.iter().enumerate() {
        let budget = budget_for(remaining, index);
        if budget == 0 {
            continue;
        }
        let mut used = 0usize;
        for caps in re.captures_iter(content) {
            if used >= budget {
                break;
            }
            let whole = caps.get(0).expect("capture group 0 always present");
            let (start, end) = (whole.start(), whole.end());

            let mut expanded = Vec::new();
            caps.expand(spec.replacement.as_bytes(), &mut expanded);

            // Later patterns win on overlap: evict earlier picks that
            // intersect this range.
            picks.retain(|&(s, e, _, _)| e <= start || s >= end);
            picks.push((start, end, expanded, index));
            used += 1;
        }
        consume_budget(remaining, index, used);
    }

    picks.sort_by_key(|&(start, _, _, _)| start);

    let mut out = Vec::with_capacity(content.len());
    let mut cursor = 0usize;
    let count = picks.len();
    for (start, end, replacement, _) in picks {
        out.extend_from_slice(&content[cursor..start]);
        out.extend_from_slice(&replacement);
        cursor = end;
    }
    out.extend_from_slice(&content[cursor..]);

    (out, count)
}

/// Transform one file through a pattern list, running on top of the
/// large-file processor for mode selection, backup, and atomic write.
pub fn regex_transform(
    engine: &Engine,
    path: &Path,
    patterns: &[PatternSpec],
    mode: TransformMode,
    dry_run: bool,
    cancel: &CancellationToken,
) -> EngineResult<TransformResult> {
    let path = engine.guard.validate(path)?;
    if patterns.is_empty() {
        return Err(EngineError::InvalidPattern {
            pattern: String::new(),
            reason: "at least one pattern is required".to_string(),
        });
    }

    let compiled: Vec<(Regex, &PatternSpec)> = patterns
        .iter()
        .map(|spec| compile_pattern(spec).map(|re| (re, spec)))
        .collect::<EngineResult<_>>()?;

    let mut remaining: Vec<Option<usize>> = patterns
        .iter()
        .map(|spec| {
            if spec.limit > 0 {
                Some(spec.limit as usize)
            } else {
                None
            }
        })
        .collect();

    // Patterns spanning lines need the whole content in one unit; plain
    // ones can stream line by line on big files.
    let processing_mode = if patterns.iter().any(|p| p.multiline) {
        ProcessingMode::Full
    } else {
        ProcessingMode::Auto
    };

    let mut total_replacements = 0usize;
    let mut apply = |bytes: &[u8], _info: &UnitInfo<'_>| {
        let (out, count) = apply_patterns(bytes, &compiled, mode, &mut remaining);
        total_replacements += count;
        Ok(out)
    };

    let config = ProcessingConfig {
        input_path: path.clone(),
        output_path: None,
        mode: processing_mode,
        chunk_size: None,
        create_backup: true,
        dry_run,
    };
    let run = process(engine, &config, cancel, &mut apply)?;

    Ok(TransformResult {
        path,
        patterns_applied: patterns.len(),
        total_replacements,
        transformed: run.transformed,
        backup_id: run.backup_id,
        dry_run,
    })
}
