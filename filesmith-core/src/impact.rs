use crate::config::RiskConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Percentage at which any change is critical regardless of thresholds.
const CRITICAL_PCT: f64 = 90.0;
/// A pattern shorter than this with more than this many matches is
/// flagged as easy to over-match.
const SHORT_PATTERN_LEN: usize = 10;
const SHORT_PATTERN_OCCURRENCES: usize = 100;

/// Qualitative magnitude of a proposed change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Structured result of pre-flight change analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeImpact {
    pub total_lines: usize,
    pub occurrences: usize,
    pub change_percentage: f64,
    pub characters_changed: usize,
    pub risk_level: RiskLevel,
    pub is_risky: bool,
    pub risk_factors: Vec<String>,
}

/// Pure function: compute the impact of replacing every occurrence of
/// `old` with `new` in `content`.
pub fn analyze_change(
    content: &str,
    old: &str,
    new: &str,
    thresholds: &RiskConfig,
) -> ChangeImpact {
    let occurrences = count_occurrences(content, old);
    let total_lines = content.lines().count();
    let characters_changed = occurrences * (old.len() + new.len());

    let change_percentage = if content.is_empty() {
        0.0
    } else {
        characters_changed as f64 / content.len() as f64 * 100.0
    };

    let mut risk_level = if change_percentage >= CRITICAL_PCT {
        RiskLevel::Critical
    } else if change_percentage >= thresholds.high_pct {
        RiskLevel::High
    } else if change_percentage >= thresholds.medium_pct {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    // Occurrence counts promote, never demote.
    if occurrences >= thresholds.high_occurrences {
        risk_level = risk_level.max(RiskLevel::High);
    } else if occurrences >= thresholds.medium_occurrences {
        risk_level = risk_level.max(RiskLevel::Medium);
    }

    let mut risk_factors = Vec::new();
    if occurrences == 0 {
        risk_factors.push("pattern has no matches in the current content".to_string());
    }
    if new.is_empty() && !old.is_empty() {
        risk_factors.push("replacement is empty: this deletes every match".to_string());
    }
    if old.len() < SHORT_PATTERN_LEN && occurrences > SHORT_PATTERN_OCCURRENCES {
        risk_factors.push(format!(
            "short pattern ({} chars) matches {} times; verify it is specific enough",
            old.len(),
            occurrences
        ));
    }

    ChangeImpact {
        total_lines,
        occurrences,
        change_percentage,
        characters_changed,
        risk_level,
        is_risky: risk_level >= RiskLevel::Medium,
        risk_factors,
    }
}

/// Aggregate per-file impacts into a batch-level risk.
pub fn analyze_batch(impacts: &[ChangeImpact]) -> RiskLevel {
    if impacts.is_empty() {
        return RiskLevel::Low;
    }

    let hot = impacts
        .iter()
        .filter(|i| i.risk_level >= RiskLevel::High)
        .count();
    let total_occurrences: usize = impacts.iter().map(|i| i.occurrences).sum();

    if hot * 2 > impacts.len() {
        RiskLevel::Critical
    } else if hot > 0 {
        RiskLevel::High
    } else if impacts.len() > 50 || total_occurrences > 200 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Risk from a file count and an edit count, shared by pipeline steps and
/// the pipeline aggregate.
pub fn assess_scale(files: usize, edits: usize) -> RiskLevel {
    if files >= 80 || edits >= 1000 {
        RiskLevel::Critical
    } else if files >= 50 || edits >= 500 {
        RiskLevel::High
    } else if files >= 30 || edits >= 100 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// The gating rule: a mutation is blocked when it is risky at high or
/// critical level and the caller did not pass `force`.
pub fn is_blocked(impact: &ChangeImpact, force: bool) -> bool {
    impact.is_risky && impact.risk_level >= RiskLevel::High && !force
}

/// Render the warning callers must present verbatim when blocking.
pub fn render_risk_warning(impact: &ChangeImpact, target: &str) -> String {
    use std::fmt::Write;

    let mut warning = format!(
        "Risky edit blocked for {}: risk level {}, {} occurrence(s), {:.1}% of the file would change.",
        target, impact.risk_level, impact.occurrences, impact.change_percentage
    );
    for factor in &impact.risk_factors {
        write!(warning, "\n  - {}", factor).unwrap();
    }
    write!(
        warning,
        "\nPreview the change with analyze_edit, or pass force: true to proceed."
    )
    .unwrap();
    warning
}

/// Non-overlapping substring occurrence count.
pub fn count_occurrences(content: &str, pattern: &str) -> usize {
    if pattern.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut rest = content;
    while let Some(pos) = rest.find(pattern) {
        count += 1;
        rest = &rest[pos + pattern.len()..];
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn thresholds() -> RiskConfig {
        RiskConfig::default()
    }

    #[test]
    fn test_count_occurrences() {
        assert_eq!(count_occurrences("alpha beta alpha", "alpha"), 2);
        assert_eq!(count_occurrences("aaaa", "aa"), 2); // non-overlapping
        assert_eq!(count_occurrences("abc", "x"), 0);
        assert_eq!(count_occurrences("abc", ""), 0);
    }

    #[test]
    fn test_low_risk_small_change() {
        let content = format!("{}\nneedle\n", "padding line\n".repeat(50));
        let impact = analyze_change(&content, "needle", "thread", &thresholds());
        assert_eq!(impact.occurrences, 1);
        assert_eq!(impact.risk_level, RiskLevel::Low);
        assert!(!impact.is_risky);
    }

    #[test]
    fn test_percentage_drives_level() {
        // 1000 chars, 100 occurrences of a 5-char pattern replaced by a
        // 5-char one: (5+5)*100/1000 = 100% of the file churns.
        let content = "abcde12345".repeat(100);
        assert_eq!(content.len(), 1000);
        let impact = analyze_change(&content, "abcde", "vwxyz", &thresholds());
        assert_eq!(impact.occurrences, 100);
        assert_eq!(impact.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_medium_below_block_thresholds() {
        // 99 occurrences of a long pattern in a large file: medium via
        // occurrence promotion, percentage stays small.
        let filler = "x".repeat(100_000);
        let needle = "specific_function_name";
        let mut content = filler;
        for _ in 0..99 {
            content.push_str(needle);
            content.push('\n');
        }
        let impact = analyze_change(&content, needle, "renamed_function_name", &thresholds());
        assert_eq!(impact.occurrences, 99);
        assert_eq!(impact.risk_level, RiskLevel::Medium);
        assert!(!is_blocked(&impact, false));
    }

    #[test]
    fn test_hundred_occurrences_blocks() {
        let filler = "x".repeat(100_000);
        let needle = "specific_function_name";
        let mut content = filler;
        for _ in 0..100 {
            content.push_str(needle);
            content.push('\n');
        }
        let impact = analyze_change(&content, needle, "renamed_function_name", &thresholds());
        assert_eq!(impact.risk_level, RiskLevel::High);
        assert!(is_blocked(&impact, false));
        assert!(!is_blocked(&impact, true));
    }

    #[test]
    fn test_critical_at_ninety_percent() {
        let content = "abcdefghij".repeat(10);
        // Replacing the whole alphabet chunk rewrites ~100% of the file.
        let impact = analyze_change(&content, "abcdefghij", "klmnopqrst", &thresholds());
        assert_eq!(impact.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_risk_factors() {
        let impact = analyze_change("nothing here", "absent", "x", &thresholds());
        assert_eq!(impact.occurrences, 0);
        assert!(impact.risk_factors.iter().any(|f| f.contains("no matches")));

        let impact = analyze_change("delete me", "delete", "", &thresholds());
        assert!(impact.risk_factors.iter().any(|f| f.contains("deletes")));

        let content = "ab ".repeat(200);
        let impact = analyze_change(&content, "ab", "cd", &thresholds());
        assert!(impact
            .risk_factors
            .iter()
            .any(|f| f.contains("short pattern")));
    }

    #[test]
    fn test_factors_do_not_change_level() {
        let impact = analyze_change("tiny", "absent", "x", &thresholds());
        assert_eq!(impact.risk_level, RiskLevel::Low);
        assert!(!impact.risk_factors.is_empty());
    }

    #[test]
    fn test_empty_content_is_low() {
        let impact = analyze_change("", "a", "b", &thresholds());
        assert_eq!(impact.change_percentage, 0.0);
        assert_eq!(impact.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_batch_majority_hot_is_critical() {
        let hot = analyze_change(&"x".repeat(10), "x".repeat(9).as_str(), "y", &thresholds());
        assert!(hot.risk_level >= RiskLevel::High);
        let cold = analyze_change("hello world", "absent", "x", &thresholds());

        assert_eq!(analyze_batch(&[hot.clone(), hot.clone(), cold.clone()]), RiskLevel::Critical);
        assert_eq!(analyze_batch(&[hot, cold.clone(), cold.clone(), cold.clone()]), RiskLevel::High);
        assert_eq!(analyze_batch(&[cold]), RiskLevel::Low);
    }

    #[test]
    fn test_batch_scale_thresholds() {
        let cold = analyze_change("hello world", "absent", "x", &thresholds());
        let many: Vec<_> = std::iter::repeat(cold).take(51).collect();
        assert_eq!(analyze_batch(&many), RiskLevel::Medium);
        assert_eq!(analyze_batch(&[]), RiskLevel::Low);
    }

    #[test]
    fn test_assess_scale() {
        assert_eq!(assess_scale(10, 10), RiskLevel::Low);
        assert_eq!(assess_scale(30, 0), RiskLevel::Medium);
        assert_eq!(assess_scale(0, 100), RiskLevel::Medium);
        assert_eq!(assess_scale(50, 0), RiskLevel::High);
        assert_eq!(assess_scale(0, 500), RiskLevel::High);
        assert_eq!(assess_scale(80, 0), RiskLevel::Critical);
        assert_eq!(assess_scale(0, 1000), RiskLevel::Critical);
    }

    #[test]
    fn test_warning_names_the_numbers() {
        let content = "token ".repeat(120);
        let impact = analyze_change(&content, "token", "ident", &thresholds());
        let warning = render_risk_warning(&impact, "src/lib.rs");
        assert!(warning.contains("src/lib.rs"));
        assert!(warning.contains("120 occurrence"));
        assert!(warning.contains("force: true"));
    }

    proptest! {
        #[test]
        fn prop_occurrences_times_len_bounded_by_content(
            content in "[ab]{0,200}",
            pattern in "[ab]{1,4}",
        ) {
            let occurrences = count_occurrences(&content, &pattern);
            prop_assert!(occurrences * pattern.len() <= content.len());
        }

        #[test]
        fn prop_level_monotone_in_occurrences(n in 0usize..200) {
            let content = "word ".repeat(n);
            let impact = analyze_change(&content, "word", "term", &thresholds());
            prop_assert_eq!(impact.occurrences, n);
            if n >= 100 {
                prop_assert!(impact.risk_level >= RiskLevel::High);
            } else if n >= 50 {
                prop_assert!(impact.risk_level >= RiskLevel::Medium);
            }
        }
    }
}
