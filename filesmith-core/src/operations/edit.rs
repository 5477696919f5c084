use crate::cancel::CancellationToken;
use crate::edit::{edit_file, EditResult};
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::multi_edit::{multi_edit_file, EditPair, MultiEditResult};
use crate::occurrence::{replace_nth_occurrence, ReplaceNthResult};
use std::path::Path;

/// Single find/replace on one file.
pub fn edit_operation(
    engine: &Engine,
    path: &Path,
    old_text: &str,
    new_text: &str,
    force: bool,
    cancel: &CancellationToken,
) -> EngineResult<EditResult> {
    let _permit = engine.semaphore.acquire(cancel)?;
    edit_file(engine, path, old_text, new_text, force, cancel)
}

/// Ordered list of find/replace pairs on one file.
pub fn multi_edit_operation(
    engine: &Engine,
    path: &Path,
    edits: &[EditPair],
    cancel: &CancellationToken,
) -> EngineResult<MultiEditResult> {
    let _permit = engine.semaphore.acquire(cancel)?;
    multi_edit_file(engine, path, edits, cancel)
}

/// Replace exactly one occurrence, addressed by ordinal.
pub fn replace_nth_operation(
    engine: &Engine,
    path: &Path,
    pattern: &str,
    replacement: &str,
    occurrence: i64,
    cancel: &CancellationToken,
) -> EngineResult<ReplaceNthResult> {
    let _permit = engine.semaphore.acquire(cancel)?;
    replace_nth_occurrence(engine, path, pattern, replacement, occurrence, cancel)
}
