use crate::backup::{BackupRecord, CleanupOutcome, CompareReport, RestoreOutcome};
use crate::edit::EditResult;
use crate::impact::ChangeImpact;
use crate::multi_edit::MultiEditResult;
use crate::occurrence::ReplaceNthResult;
use crate::pipeline::PipelineResult;
use crate::search::{CountOutcome, GrepMatch, SearchOutcome};
use crate::transform::TransformResult;
use serde::Serialize;
use std::fmt::Write;

/// Output format for the command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Summary,
    Json,
}

/// Pre-flight analysis result for the analyze_* operations.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeOutcome {
    pub path: std::path::PathBuf,
    pub operation: String,
    pub impact: ChangeImpact,
    pub would_block: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}

pub fn format_edit(result: &EditResult) -> String {
    let mut out = format!(
        "Edited {}: {} replacement(s) across {} line(s), confidence {}",
        result.path.display(),
        result.replacement_count,
        result.lines_affected,
        result.match_confidence
    );
    if let Some(ref id) = result.backup_id {
        write!(out, "\nBackup: {id}").unwrap();
    }
    out
}

pub fn format_multi_edit(result: &MultiEditResult) -> String {
    let mut out = format!(
        "Multi-edit on {}: {}/{} edit(s) applied, confidence {}",
        result.path.display(),
        result.successful,
        result.total,
        result.confidence
    );
    for attempt in &result.attempts {
        if let Some(ref error) = attempt.error {
            write!(out, "\n  edit #{}: {error}", attempt.index).unwrap();
        }
    }
    if let Some(ref id) = result.backup_id {
        write!(out, "\nBackup: {id}").unwrap();
    }
    out
}

pub fn format_replace_nth(result: &ReplaceNthResult) -> String {
    format!(
        "Replaced occurrence {}/{} in {} (line {})\nBackup: {}",
        result.replaced_index,
        result.total_occurrences,
        result.path.display(),
        result.line_number,
        result.backup_id
    )
}

pub fn format_search(outcome: &SearchOutcome, compact: bool) -> String {
    let mut out = String::new();
    if !outcome.filename_matches.is_empty() {
        writeln!(out, "File name matches ({}):", outcome.filename_matches.len()).unwrap();
        for path in &outcome.filename_matches {
            writeln!(out, "  {}", path.display()).unwrap();
        }
    }
    if !outcome.content_matches.is_empty() {
        writeln!(out, "Content matches ({}):", outcome.content_matches.len()).unwrap();
        for hit in &outcome.content_matches {
            if compact {
                writeln!(
                    out,
                    "  {}:{}:{}:{}",
                    hit.file.display(),
                    hit.line_number,
                    hit.match_start,
                    hit.match_end
                )
                .unwrap();
            } else {
                writeln!(
                    out,
                    "  {}:{}:{}:{}  {}",
                    hit.file.display(),
                    hit.line_number,
                    hit.match_start,
                    hit.match_end,
                    hit.line
                )
                .unwrap();
            }
        }
    }
    if outcome.filename_matches.is_empty() && outcome.content_matches.is_empty() {
        out.push_str("No matches found\n");
    }
    if outcome.truncated {
        out.push_str("(results truncated)\n");
    }
    out.trim_end().to_string()
}

pub fn format_grep(matches: &[GrepMatch]) -> String {
    if matches.is_empty() {
        return "No matches found".to_string();
    }
    let mut out = String::new();
    for hit in matches {
        for line in &hit.context_before {
            writeln!(out, "  {line}").unwrap();
        }
        writeln!(
            out,
            "{}:{}:{}:{}  {}",
            hit.file.display(),
            hit.line_number,
            hit.match_start,
            hit.match_end,
            hit.line
        )
        .unwrap();
        for line in &hit.context_after {
            writeln!(out, "  {line}").unwrap();
        }
    }
    out.trim_end().to_string()
}

pub fn format_count(outcome: &CountOutcome) -> String {
    let mut out = format!("{} occurrence(s) total", outcome.total);
    for (path, count) in &outcome.counts {
        write!(out, "\n  {}: {}", path.display(), count).unwrap();
        if let Some(ref lines) = outcome.lines {
            if let Some(hit_lines) = lines.get(path) {
                let rendered: Vec<String> =
                    hit_lines.iter().map(ToString::to_string).collect();
                write!(out, " (lines {})", rendered.join(", ")).unwrap();
            }
        }
    }
    out
}

pub fn format_transform(result: &TransformResult) -> String {
    let mut out = format!(
        "{} {} with {} pattern(s): {} replacement(s)",
        if result.dry_run {
            "Would transform"
        } else {
            "Transformed"
        },
        result.path.display(),
        result.patterns_applied,
        result.total_replacements
    );
    if let Some(ref id) = result.backup_id {
        write!(out, "\nBackup: {id}").unwrap();
    }
    out
}

pub fn format_pipeline(result: &PipelineResult) -> String {
    let mut out = format!(
        "Pipeline '{}': {}{}",
        result.name,
        if result.success { "ok" } else { "FAILED" },
        if result.dry_run { " (dry run)" } else { "" },
    );
    for step in &result.steps {
        write!(
            out,
            "\n  [{}] {} {}: {} file(s), {} edit(s), {} ms",
            if step.success { "ok" } else { "err" },
            step.step_id,
            step.action,
            step.files_matched.len(),
            step.edits_applied,
            step.duration_ms
        )
        .unwrap();
        if let Some(ref error) = step.error {
            write!(out, "\n      {error}").unwrap();
        }
    }
    write!(
        out,
        "\n{} file(s) affected, {} edit(s), overall risk {}",
        result.files_affected.len(),
        result.total_edits,
        result.overall_risk_level
    )
    .unwrap();
    if let Some(ref id) = result.backup_id {
        write!(out, "\nBackup: {id}").unwrap();
    }
    if result.rollback_performed {
        out.push_str("\nRollback performed: files restored to their pre-pipeline state");
    }
    out
}

pub fn format_backup_list(records: &[BackupRecord]) -> String {
    if records.is_empty() {
        return "No backups found".to_string();
    }
    let mut out = String::new();
    for record in records {
        writeln!(
            out,
            "{}  {}  {} file(s), {} byte(s)  [{}] {}",
            record.backup_id,
            record.timestamp,
            record.files.len(),
            record.total_size,
            record.operation,
            record.user_context
        )
        .unwrap();
    }
    out.trim_end().to_string()
}

pub fn format_restore(outcome: &RestoreOutcome) -> String {
    let mut out = format!(
        "Restored {} file(s) from {}",
        outcome.restored.len(),
        outcome.backup_id
    );
    for path in &outcome.restored {
        write!(out, "\n  {}", path.display()).unwrap();
    }
    for warning in &outcome.warnings {
        write!(out, "\n  warning: {warning}").unwrap();
    }
    if let Some(ref id) = outcome.pre_restore_backup {
        write!(out, "\nPre-restore state saved as {id}").unwrap();
    }
    out
}

pub fn format_compare(report: &CompareReport) -> String {
    if report.identical {
        return format!(
            "{} is identical to backup {}",
            report.file.display(),
            report.backup_id
        );
    }
    let mut out = format!(
        "{} vs backup {}: {} -> {} lines ({:+}), {} changed line(s)",
        report.file.display(),
        report.backup_id,
        report.backup_lines,
        report.current_lines,
        report.line_delta,
        report.changed_lines
    );
    for line in &report.first_differences {
        write!(out, "\n  {line}").unwrap();
    }
    out
}

pub fn format_cleanup(outcome: &CleanupOutcome) -> String {
    format!(
        "{} {} backup(s), {} byte(s){}",
        if outcome.dry_run {
            "Would delete"
        } else {
            "Deleted"
        },
        outcome.deleted_count,
        outcome.freed_bytes,
        if outcome.dry_run { " (dry run)" } else { "" }
    )
}

pub fn format_analyze(outcome: &AnalyzeOutcome) -> String {
    let mut out = format!(
        "{} on {}: risk {}, {} occurrence(s), {:.1}% change across {} line(s)",
        outcome.operation,
        outcome.path.display(),
        outcome.impact.risk_level,
        outcome.impact.occurrences,
        outcome.impact.change_percentage,
        outcome.impact.total_lines
    );
    for factor in &outcome.impact.risk_factors {
        write!(out, "\n  - {factor}").unwrap();
    }
    if outcome.would_block {
        out.push_str("\nThis operation would be BLOCKED without force: true");
    }
    out
}
