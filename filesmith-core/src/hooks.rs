use crate::impact::RiskLevel;
use std::path::Path;

/// What a pre-edit hook decided.
#[derive(Debug, Clone)]
pub enum HookDecision {
    Allow,
    /// Veto the operation with a reason the caller sees verbatim.
    Deny(String),
    /// Allow, but substitute this content for what the engine computed.
    Override(String),
}

/// Event handed to hooks around an edit.
#[derive(Debug, Clone)]
pub struct EditEvent<'a> {
    pub path: &'a Path,
    pub operation: &'a str,
    pub old_len: usize,
    pub new_len: usize,
    pub risk_level: RiskLevel,
}

/// Seam for the external hook runner. The engine consults `pre_edit`
/// before mutating and fires `post_edit` after a successful write; actual
/// shell-hook execution (and its per-hook timeout) lives outside the
/// engine.
pub trait EditHooks: Send + Sync {
    fn pre_edit(&self, _event: &EditEvent<'_>) -> HookDecision {
        HookDecision::Allow
    }

    fn post_edit(&self, _event: &EditEvent<'_>) {}
}

/// Default hooks: allow everything, observe nothing.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl EditHooks for NoopHooks {}

/// Seam for the auto-sync collaborator. Fired after every successful
/// mutation, fire-and-forget; implementations swallow their own errors.
pub trait SyncNotifier: Send + Sync {
    fn file_changed(&self, path: &Path);
}

#[derive(Debug, Default)]
pub struct NoopSync;

impl SyncNotifier for NoopSync {
    fn file_changed(&self, _path: &Path) {}
}
