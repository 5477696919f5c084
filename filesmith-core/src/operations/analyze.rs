use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::impact::{analyze_change, is_blocked, render_risk_warning};
use crate::output::AnalyzeOutcome;
use std::fs;
use std::path::Path;

/// Dry-run impact analysis of a find/replace. Never mutates.
pub fn analyze_edit_operation(
    engine: &Engine,
    path: &Path,
    old_text: &str,
    new_text: &str,
    cancel: &CancellationToken,
) -> EngineResult<AnalyzeOutcome> {
    let _permit = engine.semaphore.acquire(cancel)?;
    let path = engine.guard.validate(path)?;
    let content = fs::read_to_string(&path).map_err(|_| EngineError::NotFound {
        what: path.display().to_string(),
    })?;

    let impact = analyze_change(&content, old_text, new_text, &engine.config.risk);
    let would_block = is_blocked(&impact, false);
    let warning =
        would_block.then(|| render_risk_warning(&impact, &path.display().to_string()));

    Ok(AnalyzeOutcome {
        path,
        operation: "analyze_edit".to_string(),
        impact,
        would_block,
        warning,
    })
}

/// Dry-run impact of replacing the whole file with `new_content`.
pub fn analyze_write_operation(
    engine: &Engine,
    path: &Path,
    new_content: &str,
    cancel: &CancellationToken,
) -> EngineResult<AnalyzeOutcome> {
    let _permit = engine.semaphore.acquire(cancel)?;
    let path = engine.guard.validate(path)?;
    // A missing target means a fresh write over nothing.
    let content = fs::read_to_string(&path).unwrap_or_default();

    let impact = analyze_change(&content, &content, new_content, &engine.config.risk);
    let would_block = is_blocked(&impact, false);
    let warning =
        would_block.then(|| render_risk_warning(&impact, &path.display().to_string()));

    Ok(AnalyzeOutcome {
        path,
        operation: "analyze_write".to_string(),
        impact,
        would_block,
        warning,
    })
}

/// Dry-run impact of deleting the file outright.
pub fn analyze_delete_operation(
    engine: &Engine,
    path: &Path,
    cancel: &CancellationToken,
) -> EngineResult<AnalyzeOutcome> {
    let _permit = engine.semaphore.acquire(cancel)?;
    let path = engine.guard.validate(path)?;
    let content = fs::read_to_string(&path).map_err(|_| EngineError::NotFound {
        what: path.display().to_string(),
    })?;

    let impact = analyze_change(&content, &content, "", &engine.config.risk);
    let would_block = is_blocked(&impact, false);
    let warning =
        would_block.then(|| render_risk_warning(&impact, &path.display().to_string()));

    Ok(AnalyzeOutcome {
        path,
        operation: "analyze_delete".to_string(),
        impact,
        would_block,
        warning,
    })
}
