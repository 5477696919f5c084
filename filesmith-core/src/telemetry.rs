use parking_lot::Mutex;
use serde::Serialize;

/// An edit with `|old_text| < 100` counts as targeted; one with
/// `|old_text| > 1000` or `|new_text| > 10000` counts as a full rewrite.
const TARGETED_EDIT_MAX: usize = 100;
const FULL_REWRITE_OLD_MIN: usize = 1000;
const FULL_REWRITE_NEW_MIN: usize = 10000;

/// Observable operation counters.
#[derive(Debug, Default)]
pub struct Telemetry {
    inner: Mutex<Counters>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Counters {
    pub edits_total: u64,
    pub targeted_edits: u64,
    pub full_rewrites: u64,
    /// Running average of `|old_text| + |new_text|` per edit.
    pub avg_bytes_per_edit: f64,
    pub searches: u64,
    pub backups_created: u64,
    pub pipelines_run: u64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_edit(&self, old_len: usize, new_len: usize) {
        let mut counters = self.inner.lock();
        counters.edits_total += 1;
        if old_len < TARGETED_EDIT_MAX {
            counters.targeted_edits += 1;
        }
        if old_len > FULL_REWRITE_OLD_MIN || new_len > FULL_REWRITE_NEW_MIN {
            counters.full_rewrites += 1;
        }
        let bytes = (old_len + new_len) as f64;
        let n = counters.edits_total as f64;
        counters.avg_bytes_per_edit += (bytes - counters.avg_bytes_per_edit) / n;
    }

    pub fn record_search(&self) {
        self.inner.lock().searches += 1;
    }

    pub fn record_backup(&self) {
        self.inner.lock().backups_created += 1;
    }

    pub fn record_pipeline(&self) {
        self.inner.lock().pipelines_run += 1;
    }

    pub fn snapshot(&self) -> Counters {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targeted_and_full_rewrite_flags() {
        let telemetry = Telemetry::new();
        telemetry.record_edit(10, 20); // targeted
        telemetry.record_edit(2000, 5); // full rewrite
        telemetry.record_edit(500, 20_000); // full rewrite by new_text
        telemetry.record_edit(500, 500); // neither

        let counters = telemetry.snapshot();
        assert_eq!(counters.edits_total, 4);
        assert_eq!(counters.targeted_edits, 1);
        assert_eq!(counters.full_rewrites, 2);
    }

    #[test]
    fn test_running_average() {
        let telemetry = Telemetry::new();
        telemetry.record_edit(10, 10); // 20 bytes
        telemetry.record_edit(30, 10); // 40 bytes

        let counters = telemetry.snapshot();
        assert!((counters.avg_bytes_per_edit - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_boundary_is_exclusive() {
        let telemetry = Telemetry::new();
        telemetry.record_edit(100, 0); // exactly 100: not targeted
        telemetry.record_edit(1000, 10_000); // exactly at thresholds: not a rewrite
        let counters = telemetry.snapshot();
        assert_eq!(counters.targeted_edits, 0);
        assert_eq!(counters.full_rewrites, 0);
    }
}
