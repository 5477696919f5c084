use crate::cancel::CancellationToken;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::pipeline::{run_pipeline, PipelineRequest, PipelineResult};

/// Validate and execute a multi-step plan.
pub fn pipeline_operation(
    engine: &Engine,
    request: &PipelineRequest,
    cancel: &CancellationToken,
) -> EngineResult<PipelineResult> {
    let _permit = engine.semaphore.acquire(cancel)?;
    run_pipeline(engine, request, cancel)
}
