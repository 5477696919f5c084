use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::transform::{regex_transform, PatternSpec, TransformMode, TransformResult};
use std::path::Path;

/// Apply a pattern list to one file.
pub fn transform_operation(
    engine: &Engine,
    path: &Path,
    patterns: &[PatternSpec],
    mode: TransformMode,
    dry_run: bool,
    cancel: &CancellationToken,
) -> EngineResult<TransformResult> {
    let _permit = engine.semaphore.acquire(cancel)?;
    regex_transform(engine, path, patterns, mode, dry_run, cancel)
}
