#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod atomic;
pub mod backup;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod edit;
pub mod engine;
pub mod error;
pub mod guard;
pub mod hooks;
pub mod impact;
pub mod limits;
pub mod multi_edit;
pub mod occurrence;
pub mod operations;
pub mod output;
pub mod pipeline;
pub mod processor;
pub mod search;
pub mod telemetry;
pub mod transform;

pub use backup::{
    calculate_checksum, BackupFileEntry, BackupManager, BackupRecord, CleanupOutcome,
    CompareReport, ListFilter, RestoreOutcome,
};
pub use cancel::CancellationToken;
pub use config::EngineConfig;
pub use edit::{apply_smart_edit, edit_file, Confidence, EditOutcome, EditResult};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use guard::PathGuard;
pub use hooks::{EditEvent, EditHooks, HookDecision, NoopHooks, NoopSync, SyncNotifier};
pub use impact::{
    analyze_batch, analyze_change, assess_scale, is_blocked, render_risk_warning, ChangeImpact,
    RiskLevel,
};
pub use multi_edit::{multi_edit_file, EditAttempt, EditPair, MultiEditResult};
pub use occurrence::{replace_nth_occurrence, ReplaceNthResult};
pub use operations::{
    analyze_delete_operation, analyze_edit_operation, analyze_write_operation,
    cleanup_backups_operation, compare_backup_operation, count_operation, create_backup_operation,
    edit_operation, grep_operation, list_backups_operation, multi_edit_operation,
    pipeline_operation, replace_nth_operation, restore_backup_operation, search_operation,
    transform_operation,
};
pub use output::{AnalyzeOutcome, OutputFormat};
pub use pipeline::{
    run_pipeline, validate_plan, PipelineRequest, PipelineResult, PipelineStep, StepAction,
    StepResult, MAX_PIPELINE_FILES, MAX_PIPELINE_STEPS,
};
pub use processor::{
    process, ProcessingConfig, ProcessingMode, ProcessingResult, UnitInfo,
};
pub use search::{
    advanced_text_search, count_occurrences as count_file_occurrences, smart_search, CountOutcome,
    GrepMatch, GrepOptions, SearchMatch, SearchOutcome,
};
pub use telemetry::{Counters, Telemetry};
pub use transform::{regex_transform, PatternSpec, TransformMode, TransformResult};
