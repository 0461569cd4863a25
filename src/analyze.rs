//! Report analysis: buckets the failures of a previously written report by
//! diagnostic shape, so recurring compiler regressions surface as one line
//! with a count instead of hundreds of individual entries.
//!
//! Classification is ordered substring matching over the ANSI-stripped
//! diagnostic; the first bucket whose needle appears wins, everything else
//! lands in `other`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::exec::{CaseResult, Status, strip_ansi};
use crate::report::{Report, Summary};

/// How many example ids each reason bucket carries.
const EXAMPLES_PER_REASON: usize = 3;

/// Ordered diagnostic buckets. Order matters: the first matching needle
/// wins, so the more specific patterns come first.
const BUCKETS: &[(&str, &str)] = &[
    (
        "compile_fail_expectation_mismatch",
        "expected compile_fail, but compiled successfully",
    ),
    (
        "stack_extra_values",
        "expression left extra values on the stack",
    ),
    (
        "return_type_mismatch",
        "return type does not match signature",
    ),
    (
        "entry_missing_or_ambiguous",
        "entry function is missing or ambiguous",
    ),
    (
        "old_parenthesized_expression_syntax",
        "parenthesized expressions are not supported",
    ),
    ("unexpected_token", "unexpected token in expression"),
    ("indent_expected", "expected Indent, found"),
];

/// Fallback bucket for diagnostics no needle matches.
pub const OTHER: &str = "other";

/// Classifies one diagnostic into a bucket name.
pub fn classify(diagnostic: &str) -> &'static str {
    let plain = strip_ansi(diagnostic);
    for (name, needle) in BUCKETS {
        if plain.contains(needle) {
            return name;
        }
    }
    OTHER
}

/// One diagnostic bucket with its population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonCount {
    pub reason: String,
    pub count: usize,
    /// A few representative case ids.
    pub examples: Vec<String>,
}

/// The analysis document, printed as JSON.
#[derive(Debug, Serialize, Deserialize)]
pub struct Analysis {
    /// Path of the report that was analyzed.
    pub input: String,
    pub summary: Summary,
    /// Result count per status.
    pub by_status: BTreeMap<String, usize>,
    /// Fail/error diagnostics bucketed by shape, most common first.
    pub fail_error_reasons: Vec<ReasonCount>,
}

/// Analyzes a loaded report, keeping the `top` most common reason buckets.
pub fn analyze(report: &Report, input: String, top: usize) -> Analysis {
    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for r in &report.results {
        *by_status.entry(status_key(r.status).to_string()).or_default() += 1;
    }

    let mut buckets: BTreeMap<&'static str, ReasonCount> = BTreeMap::new();
    for r in failing(&report.results) {
        let reason = r.error.as_deref().map(classify).unwrap_or(OTHER);
        let entry = buckets.entry(reason).or_insert_with(|| ReasonCount {
            reason: reason.to_string(),
            count: 0,
            examples: Vec::new(),
        });
        entry.count += 1;
        if entry.examples.len() < EXAMPLES_PER_REASON {
            entry.examples.push(r.id.clone());
        }
    }

    // Count descending, bucket name ascending as the tiebreak.
    let mut reasons: Vec<ReasonCount> = buckets.into_values().collect();
    reasons.sort_by(|a, b| b.count.cmp(&a.count).then(a.reason.cmp(&b.reason)));
    reasons.truncate(top);

    Analysis {
        input,
        summary: report.summary,
        by_status,
        fail_error_reasons: reasons,
    }
}

fn failing(results: &[CaseResult]) -> impl Iterator<Item = &CaseResult> {
    results
        .iter()
        .filter(|r| matches!(r.status, Status::Fail | Status::Error))
}

fn status_key(status: Status) -> &'static str {
    match status {
        Status::Pass => "pass",
        Status::Fail => "fail",
        Status::Error => "error",
        Status::Skip => "skip",
    }
}
