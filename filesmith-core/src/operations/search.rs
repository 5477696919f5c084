use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::search::{
    advanced_text_search, count_occurrences, smart_search, CountOutcome, GrepMatch, GrepOptions,
    SearchOutcome,
};
use std::path::Path;

/// File-name and content search with positions.
pub fn search_operation(
    engine: &Engine,
    path: &Path,
    pattern: &str,
    include_content: bool,
    file_types: &[String],
    cancel: &CancellationToken,
) -> EngineResult<SearchOutcome> {
    let _permit = engine.semaphore.acquire(cancel)?;
    smart_search(engine, path, pattern, include_content, file_types, cancel)
}

/// Text search with case, whole-word, and context options.
pub fn grep_operation(
    engine: &Engine,
    path: &Path,
    pattern: &str,
    options: &GrepOptions,
    cancel: &CancellationToken,
) -> EngineResult<Vec<GrepMatch>> {
    let _permit = engine.semaphore.acquire(cancel)?;
    advanced_text_search(engine, path, pattern, options, cancel)
}

/// Literal occurrence counting, optionally with line numbers.
pub fn count_operation(
    engine: &Engine,
    path: &Path,
    pattern: &str,
    return_lines: bool,
    cancel: &CancellationToken,
) -> EngineResult<CountOutcome> {
    let _permit = engine.semaphore.acquire(cancel)?;
    count_occurrences(engine, path, pattern, return_lines, cancel)
}
