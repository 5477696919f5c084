use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Every distinguishable failure the engine can report.
///
/// Per-file errors inside multi-file operations (batch backup, restore,
/// pipeline with `stop_on_error = false`, search) are tallied into the
/// aggregate result instead of surfacing as one of these variants.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("access denied: {path} is outside the allowed paths")]
    AccessDenied { path: PathBuf },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("{path} is a directory, not a file")]
    IsDirectory { path: PathBuf },

    #[error("{path} is not a regular file")]
    NotAFile { path: PathBuf },

    #[error("{path} is {size} bytes, over the {limit}-byte limit for this operation")]
    TooLarge {
        path: PathBuf,
        size: u64,
        limit: u64,
    },

    #[error("context validation failed for {path}: the text to replace no longer matches the file; re-read the file and retry with current content")]
    StaleContext { path: PathBuf },

    #[error("no match found for the requested text in {path}")]
    NoMatch { path: PathBuf },

    #[error("{reason}")]
    Ambiguous { reason: String },

    #[error("{warning}")]
    Blocked { warning: String },

    #[error("pre-edit hook denied the operation: {reason}")]
    HookDenied { reason: String },

    #[error("pipeline would affect an estimated {estimated} files, over the limit of {limit}; pass force to proceed")]
    PipelineFileLimit { estimated: usize, limit: usize },

    #[error("step '{step}' depends on '{input_from}', which {reason}")]
    DependencyFailed {
        step: String,
        input_from: String,
        reason: String,
    },

    #[error("invalid pipeline: {reason}")]
    InvalidPlan { reason: String },

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("I/O error: {0}")]
    Transient(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// True when retrying the same call cannot succeed without the caller
    /// changing something (as opposed to a transient I/O condition).
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Transient(_) | Self::Cancelled)
    }
}
