use crate::atomic::{copy_file, write_atomic};
use crate::cancel::CancellationToken;
use crate::edit::{apply_smart_edit, normalize_newlines};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::impact::{assess_scale, count_occurrences, RiskLevel};
use crate::transform::{apply_patterns, compile_pattern, PatternSpec, TransformMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

pub const MAX_PIPELINE_STEPS: usize = 20;
pub const MAX_PIPELINE_FILES: usize = 100;

/// The closed set of pipeline actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Search,
    ReadRanges,
    Edit,
    MultiEdit,
    CountOccurrences,
    RegexTransform,
    Copy,
    Rename,
    Delete,
}

impl StepAction {
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            Self::Edit | Self::MultiEdit | Self::RegexTransform | Self::Delete | Self::Rename
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::ReadRanges => "read_ranges",
            Self::Edit => "edit",
            Self::MultiEdit => "multi_edit",
            Self::CountOccurrences => "count_occurrences",
            Self::RegexTransform => "regex_transform",
            Self::Copy => "copy",
            Self::Rename => "rename",
            Self::Delete => "delete",
        }
    }

    fn required_params(self) -> &'static [&'static str] {
        match self {
            Self::Search | Self::CountOccurrences => &["pattern"],
            Self::ReadRanges => &["ranges"],
            Self::Edit => &["old_text", "new_text"],
            Self::MultiEdit => &["edits"],
            Self::RegexTransform => &["patterns"],
            Self::Copy | Self::Rename => &["destination"],
            Self::Delete => &[],
        }
    }
}

/// One step in a pipeline plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: String,
    pub action: StepAction,
    /// Takes the file set produced by an earlier step. Backward
    /// references only.
    #[serde(default)]
    pub input_from: Option<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

/// A caller-declared multi-step plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub name: String,
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// None means "inferred from the presence of destructive steps".
    #[serde(default)]
    pub create_backup: Option<bool>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub verbose: bool,
    pub steps: Vec<PipelineStep>,
}

fn default_true() -> bool {
    true
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub action: &'static str,
    pub success: bool,
    pub files_matched: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<BTreeMap<PathBuf, String>>,
    pub edits_applied: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counts: BTreeMap<PathBuf, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
}

/// Aggregate outcome of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub name: String,
    pub success: bool,
    pub steps: Vec<StepResult>,
    pub backup_id: Option<String>,
    /// Deduplicated union of files touched by destructive steps.
    pub files_affected: Vec<PathBuf>,
    pub total_edits: usize,
    pub overall_risk_level: RiskLevel,
    pub rollback_performed: bool,
    pub dry_run: bool,
}

/// Validate a plan before anything executes.
pub fn validate_plan(request: &PipelineRequest) -> EngineResult<()> {
    if request.name.trim().is_empty() {
        return Err(EngineError::InvalidPlan {
            reason: "pipeline name must not be empty".to_string(),
        });
    }
    if request.steps.is_empty() {
        return Err(EngineError::InvalidPlan {
            reason: "pipeline has no steps".to_string(),
        });
    }
    if request.steps.len() > MAX_PIPELINE_STEPS {
        return Err(EngineError::InvalidPlan {
            reason: format!(
                "pipeline has {} steps, over the limit of {MAX_PIPELINE_STEPS}",
                request.steps.len()
            ),
        });
    }

    let mut seen_ids: Vec<&str> = Vec::new();
    for step in &request.steps {
        if step.id.is_empty()
            || !step
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(EngineError::InvalidPlan {
                reason: format!(
                    "step id '{}' is not valid (allowed: letters, digits, '_', '-')",
                    step.id
                ),
            });
        }
        if seen_ids.contains(&step.id.as_str()) {
            return Err(EngineError::InvalidPlan {
                reason: format!("duplicate step id '{}'", step.id),
            });
        }

        if let Some(ref input_from) = step.input_from {
            if !seen_ids.contains(&input_from.as_str()) {
                return Err(EngineError::InvalidPlan {
                    reason: format!(
                        "step '{}' references '{input_from}', which is not an earlier step",
                        step.id
                    ),
                });
            }
        }

        for required in step.action.required_params() {
            if !step.params.contains_key(*required) {
                return Err(EngineError::InvalidPlan {
                    reason: format!(
                        "step '{}' ({}) is missing required param '{required}'",
                        step.id,
                        step.action.as_str()
                    ),
                });
            }
        }

        if step.input_from.is_none() && explicit_files(step).is_empty() && root_param(step).is_none()
        {
            return Err(EngineError::InvalidPlan {
                reason: format!(
                    "step '{}' needs input_from or a non-empty 'files' or 'path' param",
                    step.id
                ),
            });
        }

        seen_ids.push(&step.id);
    }

    Ok(())
}

/// Execute a validated plan: pre-scan, batch backup, sequential steps,
/// rollback on failure under `stop_on_error`.
pub fn run_pipeline(
    engine: &Engine,
    request: &PipelineRequest,
    cancel: &CancellationToken,
) -> EngineResult<PipelineResult> {
    validate_plan(request)?;
    engine.telemetry.record_pipeline();

    let has_destructive = request.steps.iter().any(|s| s.action.is_destructive());
    let create_backup = request.create_backup.unwrap_or(has_destructive);

    let mut backup_id = None;
    if create_backup && has_destructive && !request.dry_run {
        let estimate = estimate_affected_files(engine, request, cancel)?;
        if estimate.len() > MAX_PIPELINE_FILES && !request.force {
            return Err(EngineError::PipelineFileLimit {
                estimated: estimate.len(),
                limit: MAX_PIPELINE_FILES,
            });
        }
        if !estimate.is_empty() {
            let paths: Vec<PathBuf> = estimate.into_iter().collect();
            match engine.backups.create_batch(
                &paths,
                "pipeline",
                &format!("pre-pipeline snapshot for '{}'", request.name),
            ) {
                Ok(id) => {
                    engine.telemetry.record_backup();
                    backup_id = Some(id);
                },
                // Nothing readable to back up; the plan may still be
                // creating files from scratch.
                Err(EngineError::NotFound { .. }) => {},
                Err(e) => return Err(e),
            }
        }
    }

    let mut results: Vec<StepResult> = Vec::with_capacity(request.steps.len());
    let mut outcomes: HashMap<String, (bool, Vec<PathBuf>)> = HashMap::new();
    let mut files_affected: BTreeSet<PathBuf> = BTreeSet::new();
    let mut total_edits = 0usize;
    let mut rollback_performed = false;
    let mut aborted = false;

    for step in &request.steps {
        cancel.checkpoint()?;
        let started = Instant::now();

        let outcome = execute_step(engine, step, &outcomes, request, cancel);
        let duration_ms = started.elapsed().as_millis() as u64;

        let step_result = match outcome {
            Ok(mut data) => {
                data.duration_ms = duration_ms;
                data
            },
            Err(e) => StepResult {
                step_id: step.id.clone(),
                action: step.action.as_str(),
                success: false,
                files_matched: Vec::new(),
                content: None,
                edits_applied: 0,
                counts: BTreeMap::new(),
                error: Some(e.to_string()),
                duration_ms,
                risk_level: None,
            },
        };

        outcomes.insert(
            step.id.clone(),
            (step_result.success, step_result.files_matched.clone()),
        );
        if step_result.success && step.action.is_destructive() {
            files_affected.extend(step_result.files_matched.iter().cloned());
            total_edits += step_result.edits_applied;
        }

        let failed = !step_result.success;
        results.push(step_result);

        if failed && request.stop_on_error {
            if let Some(ref id) = backup_id {
                warn!(pipeline = %request.name, backup_id = %id, "step failed, rolling back");
                match engine.backups.restore(id, None, false) {
                    Ok(outcome) => {
                        for path in &outcome.restored {
                            engine.cache.invalidate(path);
                        }
                        rollback_performed = true;
                    },
                    Err(e) => {
                        warn!(error = %e, "rollback restore failed");
                    },
                }
            }
            aborted = true;
            break;
        }
    }

    let success = if aborted {
        false
    } else if request.stop_on_error {
        results.iter().all(|r| r.success)
    } else {
        results.iter().any(|r| r.success)
    };

    let overall_risk_level = assess_scale(files_affected.len(), total_edits);

    info!(
        pipeline = %request.name,
        steps = results.len(),
        success,
        total_edits,
        rollback = rollback_performed,
        "pipeline finished"
    );

    Ok(PipelineResult {
        name: request.name.clone(),
        success,
        steps: results,
        backup_id,
        files_affected: files_affected.into_iter().collect(),
        total_edits,
        overall_risk_level,
        rollback_performed,
        dry_run: request.dry_run,
    })
}

/// Pre-scan: run only the search steps read-only and collect explicit
/// `files` params of destructive steps to estimate the affected set.
fn estimate_affected_files(
    engine: &Engine,
    request: &PipelineRequest,
    cancel: &CancellationToken,
) -> EngineResult<BTreeSet<PathBuf>> {
    let mut search_hits: HashMap<&str, Vec<PathBuf>> = HashMap::new();
    let mut estimate = BTreeSet::new();

    for step in &request.steps {
        match step.action {
            StepAction::Search => {
                if let (Some(root), Some(pattern)) = (root_param(step), param_str(step, "pattern"))
                {
                    let outcome = crate::search::smart_search(
                        engine,
                        Path::new(root),
                        pattern,
                        true,
                        &[],
                        cancel,
                    )?;
                    let files: Vec<PathBuf> = outcome
                        .content_matches
                        .iter()
                        .map(|m| m.file.clone())
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    search_hits.insert(step.id.as_str(), files);
                }
            },
            action if action.is_destructive() => {
                for file in explicit_files(step) {
                    estimate.insert(engine.guard.validate(Path::new(&file))?);
                }
                if let Some(ref from) = step.input_from {
                    if let Some(files) = search_hits.get(from.as_str()) {
                        estimate.extend(files.iter().cloned());
                    }
                }
            },
            _ => {},
        }
    }

    Ok(estimate)
}

/// Run one step. Returns a populated `StepResult` (duration filled by the
/// caller) or an error that the caller records as the step failure.
fn execute_step(
    engine: &Engine,
    step: &PipelineStep,
    outcomes: &HashMap<String, (bool, Vec<PathBuf>)>,
    request: &PipelineRequest,
    cancel: &CancellationToken,
) -> EngineResult<StepResult> {
    let mut result = StepResult {
        step_id: step.id.clone(),
        action: step.action.as_str(),
        success: true,
        files_matched: Vec::new(),
        content: None,
        edits_applied: 0,
        counts: BTreeMap::new(),
        error: None,
        duration_ms: 0,
        risk_level: None,
    };

    match step.action {
        StepAction::Search => {
            let root = root_param(step).ok_or_else(|| EngineError::InvalidPlan {
                reason: format!("step '{}' needs a 'path' param", step.id),
            })?;
            let pattern = required_str(step, "pattern")?;
            let outcome =
                crate::search::smart_search(engine, Path::new(root), pattern, true, &[], cancel)?;
            let files: BTreeSet<PathBuf> = outcome
                .content_matches
                .iter()
                .map(|m| m.file.clone())
                .collect();
            for m in &outcome.content_matches {
                *result.counts.entry(m.file.clone()).or_insert(0) += 1;
            }
            result.files_matched = files.into_iter().collect();
            return Ok(result);
        },
        StepAction::ReadRanges => {
            let files = resolve_inputs(engine, step, outcomes)?;
            let ranges = parse_ranges(step)?;
            let mut content = BTreeMap::new();
            for file in &files {
                cancel.checkpoint()?;
                let text = fs::read_to_string(file)?;
                content.insert(file.clone(), extract_ranges(&text, &ranges));
            }
            result.files_matched = files;
            result.content = Some(content);
            return Ok(result);
        },
        StepAction::CountOccurrences => {
            let files = resolve_inputs(engine, step, outcomes)?;
            let pattern = required_str(step, "pattern")?;
            for file in &files {
                cancel.checkpoint()?;
                let text = fs::read_to_string(file)?;
                let count = count_occurrences(&text, pattern);
                if count > 0 {
                    result.counts.insert(file.clone(), count);
                }
            }
            result.files_matched = result.counts.keys().cloned().collect();
            return Ok(result);
        },
        _ => {},
    }

    // The remaining actions mutate. Resolve inputs; edit, multi_edit,
    // regex_transform, and delete also compute and enforce a risk level.
    // Copy and rename are never risk-gated (rename still shows up in the
    // backup pre-scan, which is a separate concern).
    let files = resolve_inputs(engine, step, outcomes)?;

    if matches!(
        step.action,
        StepAction::Edit | StepAction::MultiEdit | StepAction::RegexTransform | StepAction::Delete
    ) {
        let estimated_edits = estimate_step_edits(step, &files)?;
        let risk = assess_scale(files.len(), estimated_edits);
        result.risk_level = Some(risk);

        if !request.dry_run && risk >= RiskLevel::High && !request.force {
            return Err(EngineError::Blocked {
                warning: format!(
                    "step '{}' is {risk} risk ({} files, ~{estimated_edits} edits); preview with dry_run or pass force",
                    step.id,
                    files.len()
                ),
            });
        }
    }

    match step.action {
        StepAction::Edit => {
            let old_text = required_str(step, "old_text")?.to_string();
            let new_text = required_str(step, "new_text")?.to_string();
            for file in &files {
                cancel.checkpoint()?;
                let text = normalize_newlines(&fs::read_to_string(file)?).into_owned();
                let Some(outcome) = apply_smart_edit(&text, &old_text, &new_text) else {
                    continue;
                };
                if request.dry_run || request.verbose {
                    result.counts.insert(file.clone(), outcome.replacement_count);
                }
                if !request.dry_run {
                    write_atomic(file, outcome.content.as_bytes())?;
                    engine.cache.invalidate(file);
                    engine.notify_sync(file);
                }
                result.edits_applied += outcome.replacement_count;
                result.files_matched.push(file.clone());
            }
        },
        StepAction::MultiEdit => {
            let (pairs, pair_errors) = valid_pairs(parse_edit_pairs(step)?);
            for message in &pair_errors {
                warn!(step = %step.id, "{message}, skipping");
            }
            for file in &files {
                cancel.checkpoint()?;
                let mut text = normalize_newlines(&fs::read_to_string(file)?).into_owned();
                let mut applied = 0usize;
                for (old_text, new_text) in &pairs {
                    if let Some(outcome) = apply_smart_edit(&text, old_text, new_text) {
                        text = outcome.content;
                        applied += outcome.replacement_count;
                    }
                }
                if applied == 0 {
                    continue;
                }
                if request.dry_run || request.verbose {
                    result.counts.insert(file.clone(), applied);
                }
                if !request.dry_run {
                    write_atomic(file, text.as_bytes())?;
                    engine.cache.invalidate(file);
                    engine.notify_sync(file);
                }
                result.edits_applied += applied;
                result.files_matched.push(file.clone());
            }
            // The step only fails when every edit failed; recorded
            // per-edit failures ride along on a successful step.
            if result.edits_applied == 0 && !pair_errors.is_empty() {
                return Err(EngineError::Ambiguous {
                    reason: format!(
                        "step '{}': no edits applied; {}",
                        step.id,
                        pair_errors.join("; ")
                    ),
                });
            }
            if !pair_errors.is_empty() {
                result.error = Some(format!("skipped: {}", pair_errors.join("; ")));
            }
        },
        StepAction::RegexTransform => {
            let specs = parse_patterns(step)?;
            let mode = parse_transform_mode(step)?;
            let compiled: Vec<_> = specs
                .iter()
                .map(|s| compile_pattern(s).map(|re| (re, s)))
                .collect::<EngineResult<_>>()?;
            for file in &files {
                cancel.checkpoint()?;
                let bytes = fs::read(file)?;
                let mut remaining: Vec<Option<usize>> = specs
                    .iter()
                    .map(|s| (s.limit > 0).then_some(s.limit as usize))
                    .collect();
                let (out, count) = apply_patterns(&bytes, &compiled, mode, &mut remaining);
                if count == 0 {
                    continue;
                }
                if request.dry_run || request.verbose {
                    result.counts.insert(file.clone(), count);
                }
                if !request.dry_run {
                    write_atomic(file, &out)?;
                    engine.cache.invalidate(file);
                    engine.notify_sync(file);
                }
                result.edits_applied += count;
                result.files_matched.push(file.clone());
            }
        },
        StepAction::Copy => {
            let destination = engine
                .guard
                .validate(Path::new(required_str(step, "destination")?))?;
            let into_dir = files.len() > 1 || destination.is_dir();
            for file in &files {
                cancel.checkpoint()?;
                let target = if into_dir {
                    destination.join(file.file_name().ok_or_else(|| {
                        EngineError::NotAFile { path: file.clone() }
                    })?)
                } else {
                    destination.clone()
                };
                if request.dry_run {
                    result.files_matched.push(target);
                    continue;
                }
                copy_file(file, &target)?;
                engine.cache.invalidate(&target);
                engine.notify_sync(&target);
                result.files_matched.push(target);
            }
        },
        StepAction::Rename => {
            if files.len() != 1 {
                return Err(EngineError::InvalidPlan {
                    reason: format!(
                        "step '{}': rename takes exactly one input file, got {}",
                        step.id,
                        files.len()
                    ),
                });
            }
            let destination = engine
                .guard
                .validate(Path::new(required_str(step, "destination")?))?;
            if request.dry_run {
                result.files_matched.push(destination);
            } else {
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&files[0], &destination)?;
                engine.cache.invalidate(&files[0]);
                engine.cache.invalidate(&destination);
                engine.notify_sync(&destination);
                result.files_matched.push(destination);
            }
        },
        StepAction::Delete => {
            for file in &files {
                cancel.checkpoint()?;
                if request.dry_run {
                    result.files_matched.push(file.clone());
                    continue;
                }
                fs::remove_file(file)?;
                engine.cache.invalidate(file);
                result.files_matched.push(file.clone());
            }
        },
        StepAction::Search | StepAction::ReadRanges | StepAction::CountOccurrences => {
            unreachable!("read-only actions handled above")
        },
    }

    Ok(result)
}

/// Read-only estimate of how many edits a destructive step would apply.
fn estimate_step_edits(step: &PipelineStep, files: &[PathBuf]) -> EngineResult<usize> {
    let mut total = 0usize;
    match step.action {
        StepAction::Edit => {
            let old_text = required_str(step, "old_text")?;
            for file in files {
                if let Ok(text) = fs::read_to_string(file) {
                    total += count_occurrences(&text, old_text);
                }
            }
        },
        StepAction::MultiEdit => {
            let (pairs, _) = valid_pairs(parse_edit_pairs(step)?);
            for file in files {
                if let Ok(text) = fs::read_to_string(file) {
                    for (old_text, _) in &pairs {
                        total += count_occurrences(&text, old_text);
                    }
                }
            }
        },
        StepAction::RegexTransform => {
            let specs = parse_patterns(step)?;
            for file in files {
                if let Ok(bytes) = fs::read(file) {
                    for spec in &specs {
                        if let Ok(re) = compile_pattern(spec) {
                            total += re.find_iter(&bytes).count();
                        }
                    }
                }
            }
        },
        _ => {},
    }
    Ok(total)
}

/// Resolve the step's input file set: `input_from` first, else the
/// step's own `files`/`path` params, all normalized through the guard.
fn resolve_inputs(
    engine: &Engine,
    step: &PipelineStep,
    outcomes: &HashMap<String, (bool, Vec<PathBuf>)>,
) -> EngineResult<Vec<PathBuf>> {
    if let Some(ref from) = step.input_from {
        let (success, files) =
            outcomes
                .get(from.as_str())
                .ok_or_else(|| EngineError::DependencyFailed {
                    step: step.id.clone(),
                    input_from: from.clone(),
                    reason: "did not run".to_string(),
                })?;
        if !success {
            return Err(EngineError::DependencyFailed {
                step: step.id.clone(),
                input_from: from.clone(),
                reason: "failed".to_string(),
            });
        }
        if files.is_empty() {
            return Err(EngineError::DependencyFailed {
                step: step.id.clone(),
                input_from: from.clone(),
                reason: "matched no files".to_string(),
            });
        }
        return Ok(files.clone());
    }

    let mut resolved = Vec::new();
    for file in explicit_files(step) {
        resolved.push(engine.guard.validate(Path::new(&file))?);
    }
    if resolved.is_empty() {
        if let Some(root) = root_param(step) {
            resolved.push(engine.guard.validate(Path::new(root))?);
        }
    }
    if resolved.is_empty() {
        return Err(EngineError::InvalidPlan {
            reason: format!("step '{}' resolved no input files", step.id),
        });
    }
    Ok(resolved)
}

/// `files` param as a list: accepts a single string or a string array.
fn explicit_files(step: &PipelineStep) -> Vec<String> {
    match step.params.get("files") {
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn root_param(step: &PipelineStep) -> Option<&str> {
    step.params
        .get("path")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn param_str<'a>(step: &'a PipelineStep, key: &str) -> Option<&'a str> {
    step.params.get(key).and_then(Value::as_str)
}

fn required_str<'a>(step: &'a PipelineStep, key: &str) -> EngineResult<&'a str> {
    param_str(step, key).ok_or_else(|| EngineError::InvalidPlan {
        reason: format!("step '{}' param '{key}' must be a string", step.id),
    })
}

/// `ranges` param: `[[start, end], ...]`, 1-based inclusive line ranges.
fn parse_ranges(step: &PipelineStep) -> EngineResult<Vec<(usize, usize)>> {
    let value = step
        .params
        .get("ranges")
        .ok_or_else(|| EngineError::InvalidPlan {
            reason: format!("step '{}' is missing 'ranges'", step.id),
        })?;
    let items = value.as_array().ok_or_else(|| EngineError::InvalidPlan {
        reason: format!("step '{}': 'ranges' must be an array", step.id),
    })?;

    let mut ranges = Vec::new();
    for item in items {
        let pair = item.as_array().filter(|a| a.len() == 2);
        let (start, end) = match pair {
            Some(a) => (
                a[0].as_u64().unwrap_or(0) as usize,
                a[1].as_u64().unwrap_or(0) as usize,
            ),
            None => (0, 0),
        };
        if start == 0 || end < start {
            return Err(EngineError::InvalidPlan {
                reason: format!(
                    "step '{}': each range must be [start, end] with 1 <= start <= end",
                    step.id
                ),
            });
        }
        ranges.push((start, end));
    }
    Ok(ranges)
}

fn extract_ranges(text: &str, ranges: &[(usize, usize)]) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = Vec::new();
    for &(start, end) in ranges {
        let from = start.saturating_sub(1).min(lines.len());
        let to = end.min(lines.len());
        out.extend_from_slice(&lines[from..to]);
    }
    out.join("\n")
}

/// One entry from a multi_edit step's `edits` array: a usable pair, or a
/// per-edit failure that is recorded and skipped rather than failing the
/// plan.
enum EditPairEntry {
    Pair(String, String),
    Skipped(String),
}

fn parse_edit_pairs(step: &PipelineStep) -> EngineResult<Vec<EditPairEntry>> {
    let value = step
        .params
        .get("edits")
        .ok_or_else(|| EngineError::InvalidPlan {
            reason: format!("step '{}' is missing 'edits'", step.id),
        })?;
    let items = value.as_array().ok_or_else(|| EngineError::InvalidPlan {
        reason: format!("step '{}': 'edits' must be an array", step.id),
    })?;

    let mut entries = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let old_text = item.get("old_text").and_then(Value::as_str).unwrap_or("");
        let new_text = item.get("new_text").and_then(Value::as_str);
        if old_text.is_empty() {
            entries.push(EditPairEntry::Skipped(format!(
                "edit #{index}: old_text is empty"
            )));
        } else if let Some(new_text) = new_text {
            entries.push(EditPairEntry::Pair(
                old_text.to_string(),
                new_text.to_string(),
            ));
        } else {
            entries.push(EditPairEntry::Skipped(format!(
                "edit #{index}: new_text is missing"
            )));
        }
    }
    Ok(entries)
}

fn valid_pairs(entries: Vec<EditPairEntry>) -> (Vec<(String, String)>, Vec<String>) {
    let mut pairs = Vec::new();
    let mut errors = Vec::new();
    for entry in entries {
        match entry {
            EditPairEntry::Pair(old, new) => pairs.push((old, new)),
            EditPairEntry::Skipped(message) => errors.push(message),
        }
    }
    (pairs, errors)
}

fn parse_patterns(step: &PipelineStep) -> EngineResult<Vec<PatternSpec>> {
    let value = step
        .params
        .get("patterns")
        .ok_or_else(|| EngineError::InvalidPlan {
            reason: format!("step '{}' is missing 'patterns'", step.id),
        })?;
    serde_json::from_value(value.clone()).map_err(|e| EngineError::InvalidPlan {
        reason: format!("step '{}': bad 'patterns': {e}", step.id),
    })
}

fn parse_transform_mode(step: &PipelineStep) -> EngineResult<TransformMode> {
    match step.params.get("mode") {
        None => Ok(TransformMode::Sequential),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            EngineError::InvalidPlan {
                reason: format!("step '{}': bad 'mode': {e}", step.id),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn engine_for(temp_dir: &TempDir) -> Engine {
        let mut config = EngineConfig::default();
        config.allowed_paths = vec![temp_dir.path().to_path_buf()];
        config.backup.backup_dir = temp_dir.path().join(".backup-store");
        config.parallel_ops = 2;
        Engine::new(config).unwrap()
    }

    fn step(id: &str, action: StepAction, params: Value) -> PipelineStep {
        PipelineStep {
            id: id.to_string(),
            action,
            input_from: None,
            params: params.as_object().cloned().unwrap_or_default(),
        }
    }

    fn request(name: &str, steps: Vec<PipelineStep>) -> PipelineRequest {
        PipelineRequest {
            name: name.to_string(),
            stop_on_error: true,
            dry_run: false,
            create_backup: None,
            force: false,
            verbose: false,
            steps,
        }
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let req = request(
            " ",
            vec![step("a", StepAction::Delete, json!({"files": ["/tmp/x"]}))],
        );
        assert!(matches!(
            validate_plan(&req),
            Err(EngineError::InvalidPlan { .. })
        ));
    }

    #[test]
    fn test_validate_step_count_limit() {
        let steps: Vec<PipelineStep> = (0..21)
            .map(|i| {
                step(
                    &format!("s{i}"),
                    StepAction::Delete,
                    json!({"files": ["/tmp/x"]}),
                )
            })
            .collect();
        let req = request("too-big", steps);
        assert!(matches!(
            validate_plan(&req),
            Err(EngineError::InvalidPlan { .. })
        ));

        let steps: Vec<PipelineStep> = (0..20)
            .map(|i| {
                step(
                    &format!("s{i}"),
                    StepAction::Delete,
                    json!({"files": ["/tmp/x"]}),
                )
            })
            .collect();
        assert!(validate_plan(&request("just-right", steps)).is_ok());
    }

    #[test]
    fn test_validate_duplicate_and_malformed_ids() {
        let req = request(
            "dups",
            vec![
                step("same", StepAction::Delete, json!({"files": ["/tmp/x"]})),
                step("same", StepAction::Delete, json!({"files": ["/tmp/x"]})),
            ],
        );
        assert!(matches!(
            validate_plan(&req),
            Err(EngineError::InvalidPlan { .. })
        ));

        let req = request(
            "badid",
            vec![step(
                "has space",
                StepAction::Delete,
                json!({"files": ["/tmp/x"]}),
            )],
        );
        assert!(matches!(
            validate_plan(&req),
            Err(EngineError::InvalidPlan { .. })
        ));
    }

    #[test]
    fn test_validate_forward_reference_rejected() {
        let mut first = step("first", StepAction::Edit, json!({"old_text": "a", "new_text": "b"}));
        first.input_from = Some("later".to_string());
        let req = request(
            "forward",
            vec![
                first,
                step("later", StepAction::Search, json!({"pattern": "x", "path": "/tmp"})),
            ],
        );
        assert!(matches!(
            validate_plan(&req),
            Err(EngineError::InvalidPlan { .. })
        ));
    }

    #[test]
    fn test_validate_missing_required_param() {
        let req = request(
            "missing",
            vec![step("e", StepAction::Edit, json!({"files": ["/tmp/x"], "old_text": "a"}))],
        );
        let err = validate_plan(&req).unwrap_err();
        assert!(err.to_string().contains("new_text"));
    }

    #[test]
    fn test_validate_missing_file_source() {
        let req = request(
            "nofiles",
            vec![step("e", StepAction::Edit, json!({"old_text": "a", "new_text": "b"}))],
        );
        let err = validate_plan(&req).unwrap_err();
        assert!(err.to_string().contains("input_from"));
    }

    #[test]
    fn test_search_then_edit() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let work = temp_dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("a.txt"), "foo here\n").unwrap();
        fs::write(work.join("b.txt"), "foo there\n").unwrap();
        fs::write(work.join("c.txt"), "nothing\n").unwrap();

        let mut edit = step(
            "replace",
            StepAction::Edit,
            json!({"old_text": "foo", "new_text": "bar"}),
        );
        edit.input_from = Some("find".to_string());

        let req = request(
            "rename-foo",
            vec![
                step(
                    "find",
                    StepAction::Search,
                    json!({"pattern": "foo", "path": work.to_str().unwrap()}),
                ),
                edit,
            ],
        );

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();

        assert!(result.success);
        assert_eq!(result.total_edits, 2);
        assert_eq!(result.files_affected.len(), 2);
        assert!(result.backup_id.is_some());
        assert!(!result.rollback_performed);
        assert_eq!(fs::read_to_string(work.join("a.txt")).unwrap(), "bar here\n");
        assert_eq!(fs::read_to_string(work.join("b.txt")).unwrap(), "bar there\n");
        assert_eq!(fs::read_to_string(work.join("c.txt")).unwrap(), "nothing\n");
    }

    #[test]
    fn test_rollback_on_step_failure() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let work = temp_dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("a.txt"), "foo a\n").unwrap();
        fs::write(work.join("b.txt"), "foo b\n").unwrap();
        let missing = work.join("gone.txt");

        // The edit step lists an unreadable file, so it fails after the
        // earlier files were already written.
        let req = request(
            "doomed",
            vec![step(
                "edit",
                StepAction::Edit,
                json!({
                    "old_text": "foo",
                    "new_text": "bar",
                    "files": [
                        work.join("a.txt").to_str().unwrap(),
                        work.join("b.txt").to_str().unwrap(),
                        missing.to_str().unwrap(),
                    ]
                }),
            )],
        );

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();

        assert!(!result.success);
        assert!(result.rollback_performed);
        assert!(result.backup_id.is_some());
        // Previously edited files are back to their pre-pipeline state.
        assert_eq!(fs::read_to_string(work.join("a.txt")).unwrap(), "foo a\n");
        assert_eq!(fs::read_to_string(work.join("b.txt")).unwrap(), "foo b\n");
        assert!(!result.steps[0].success);
    }

    #[test]
    fn test_stop_on_error_false_continues() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let good = temp_dir.path().join("good.txt");
        fs::write(&good, "value\n").unwrap();
        let missing = temp_dir.path().join("missing.txt");

        let mut req = request(
            "keep-going",
            vec![
                step(
                    "bad",
                    StepAction::Edit,
                    json!({
                        "old_text": "x",
                        "new_text": "y",
                        "files": [missing.to_str().unwrap()]
                    }),
                ),
                step(
                    "good",
                    StepAction::Edit,
                    json!({
                        "old_text": "value",
                        "new_text": "worth",
                        "files": [good.to_str().unwrap()]
                    }),
                ),
            ],
        );
        req.stop_on_error = false;

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();

        assert!(result.success); // at least one step succeeded
        assert!(!result.steps[0].success);
        assert!(result.steps[1].success);
        assert!(!result.rollback_performed);
        assert_eq!(fs::read_to_string(&good).unwrap(), "worth\n");
    }

    #[test]
    fn test_dependency_on_failed_step() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let missing = temp_dir.path().join("missing.txt");

        let mut dependent = step(
            "dependent",
            StepAction::Edit,
            json!({"old_text": "a", "new_text": "b"}),
        );
        dependent.input_from = Some("bad".to_string());

        let mut req = request(
            "deps",
            vec![
                step(
                    "bad",
                    StepAction::Edit,
                    json!({
                        "old_text": "x",
                        "new_text": "y",
                        "files": [missing.to_str().unwrap()]
                    }),
                ),
                dependent,
            ],
        );
        req.stop_on_error = false;

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();

        assert!(!result.steps[1].success);
        assert!(result.steps[1]
            .error
            .as_deref()
            .unwrap()
            .contains("failed"));
    }

    #[test]
    fn test_dry_run_mutates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "foo foo\n").unwrap();

        let mut req = request(
            "preview",
            vec![step(
                "edit",
                StepAction::Edit,
                json!({
                    "old_text": "foo",
                    "new_text": "bar",
                    "files": [file.to_str().unwrap()]
                }),
            )],
        );
        req.dry_run = true;

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();

        assert!(result.success);
        assert!(result.dry_run);
        assert_eq!(result.total_edits, 2);
        assert_eq!(result.steps[0].counts.get(&file.to_path_buf()).copied(), Some(2));
        assert_eq!(fs::read_to_string(&file).unwrap(), "foo foo\n");
        // Dry runs take no backups.
        assert!(result.backup_id.is_none());
    }

    #[test]
    fn test_count_and_read_ranges() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "one\ntwo\nthree\nfour\nfive\n").unwrap();

        let req = request(
            "inspect",
            vec![
                step(
                    "count",
                    StepAction::CountOccurrences,
                    json!({"pattern": "o", "files": [file.to_str().unwrap()]}),
                ),
                step(
                    "slice",
                    StepAction::ReadRanges,
                    json!({"ranges": [[2, 4]], "files": [file.to_str().unwrap()]}),
                ),
            ],
        );

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();

        assert!(result.success);
        // "one", "two", "four" contain 'o'.
        assert_eq!(result.steps[0].counts.values().next().copied(), Some(3));
        let content = result.steps[1].content.as_ref().unwrap();
        assert_eq!(content.values().next().unwrap(), "two\nthree\nfour");
    }

    #[test]
    fn test_copy_rename_delete_flow() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let src = temp_dir.path().join("src.txt");
        fs::write(&src, "payload\n").unwrap();
        let copy_dest = temp_dir.path().join("copies");
        let renamed = temp_dir.path().join("renamed.txt");

        let req = request(
            "file-ops",
            vec![
                step(
                    "dup",
                    StepAction::Copy,
                    json!({
                        "files": [src.to_str().unwrap()],
                        "destination": copy_dest.join("src.txt").to_str().unwrap()
                    }),
                ),
                step(
                    "mv",
                    StepAction::Rename,
                    json!({
                        "files": [src.to_str().unwrap()],
                        "destination": renamed.to_str().unwrap()
                    }),
                ),
                step(
                    "rm",
                    StepAction::Delete,
                    json!({"files": [renamed.to_str().unwrap()]}),
                ),
            ],
        );

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();

        assert!(result.success, "steps: {:?}", result.steps);
        assert_eq!(
            fs::read_to_string(copy_dest.join("src.txt")).unwrap(),
            "payload\n"
        );
        assert!(!src.exists());
        assert!(!renamed.exists());

        // Copy and rename never compute a risk level; delete does.
        assert!(result.steps[0].risk_level.is_none());
        assert!(result.steps[1].risk_level.is_none());
        assert!(result.steps[2].risk_level.is_some());
    }

    #[test]
    fn test_copy_at_scale_runs_without_force() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let work = temp_dir.path().join("sources");
        fs::create_dir_all(&work).unwrap();
        let mut files = Vec::new();
        for i in 0..60 {
            let file = work.join(format!("f{i:02}.txt"));
            fs::write(&file, "data\n").unwrap();
            files.push(file.to_str().unwrap().to_string());
        }
        let dest = temp_dir.path().join("copies");

        // 60 files would be high risk for an edit step; copy is exempt.
        let req = request(
            "bulk-copy",
            vec![step(
                "dup",
                StepAction::Copy,
                json!({"files": files, "destination": dest.to_str().unwrap()}),
            )],
        );

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();

        assert!(result.success, "steps: {:?}", result.steps);
        assert!(result.steps[0].risk_level.is_none());
        assert_eq!(result.steps[0].files_matched.len(), 60);
        assert!(dest.join("f59.txt").exists());
    }

    #[test]
    fn test_multi_edit_step_skips_bad_pairs_and_applies_rest() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "key=old;").unwrap();

        let req = request(
            "partial",
            vec![step(
                "edits",
                StepAction::MultiEdit,
                json!({
                    "files": [file.to_str().unwrap()],
                    "edits": [
                        {"old_text": "", "new_text": "x"},
                        {"old_text": "ghost"},
                        {"old_text": "key=old", "new_text": "key=new"}
                    ]
                }),
            )],
        );

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();

        assert!(result.success, "steps: {:?}", result.steps);
        assert!(result.steps[0].success);
        assert_eq!(result.steps[0].edits_applied, 1);
        let note = result.steps[0].error.as_deref().unwrap();
        assert!(note.contains("old_text is empty"));
        assert!(note.contains("new_text is missing"));
        assert_eq!(fs::read_to_string(&file).unwrap(), "key=new;");
    }

    #[test]
    fn test_multi_edit_step_fails_when_no_edit_succeeds() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "content").unwrap();

        let req = request(
            "all-bad",
            vec![step(
                "edits",
                StepAction::MultiEdit,
                json!({
                    "files": [file.to_str().unwrap()],
                    "edits": [{"old_text": "", "new_text": "x"}]
                }),
            )],
        );

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();

        assert!(!result.success);
        assert!(!result.steps[0].success);
        assert!(result.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("old_text is empty"));
        // Nothing was written.
        assert_eq!(fs::read_to_string(&file).unwrap(), "content");
    }

    #[test]
    fn test_regex_transform_step() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("log.txt");
        fs::write(&file, "warn: a\nwarn: b\n").unwrap();

        let req = request(
            "transform",
            vec![step(
                "rewrite",
                StepAction::RegexTransform,
                json!({
                    "files": [file.to_str().unwrap()],
                    "patterns": [
                        {"pattern": "warn", "replacement": "error"}
                    ]
                }),
            )],
        );

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();
        assert!(result.success);
        assert_eq!(result.total_edits, 2);
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "error: a\nerror: b\n"
        );
    }

    #[test]
    fn test_risk_gate_blocks_large_step() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine_for(&temp_dir);
        let file = temp_dir.path().join("hot.txt");
        fs::write(&file, "tok ".repeat(600)).unwrap();

        let req = request(
            "risky",
            vec![step(
                "edit",
                StepAction::Edit,
                json!({
                    "old_text": "tok",
                    "new_text": "sym",
                    "files": [file.to_str().unwrap()]
                }),
            )],
        );

        let cancel = CancellationToken::new();
        let result = run_pipeline(&engine, &req, &cancel).unwrap();
        assert!(!result.success);
        assert!(result.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("force"));
        assert_eq!(fs::read_to_string(&file).unwrap(), "tok ".repeat(600));

        // force pushes it through.
        let mut forced = request(
            "risky-forced",
            vec![step(
                "edit",
                StepAction::Edit,
                json!({
                    "old_text": "tok",
                    "new_text": "sym",
                    "files": [file.to_str().unwrap()]
                }),
            )],
        );
        forced.force = true;
        let result = run_pipeline(&engine, &forced, &cancel).unwrap();
        assert!(result.success);
        assert_eq!(result.total_edits, 600);
    }
}
