//! Dual-backend comparison.
//!
//! When a run exercises both backends, every case executed by the reference
//! backend appears twice in the result set: once under its base id and once
//! under `<id>::llvm`. The comparator pairs those records and checks that
//! both backends observed the same program behavior, emitting one synthetic
//! `<id>::compare` result per divergence.
//!
//! Only pairs where both sides passed their run phase are compared; a case
//! that already failed or errored on either side has its own diagnostic and
//! a comparison record would only repeat it. Expectation-inverting cases
//! (`compile_fail`, `should_panic`) are excluded too, since their observable
//! output is diagnostic text that legitimately differs between backends.

use std::collections::BTreeMap;

use tracing::debug;

use crate::backend::BackendKind;
use crate::exec::{CaseResult, Phase, Status, normalize};

/// Comparator configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompareOptions {
    /// Report a reference-side result with no base counterpart (or the
    /// reverse) as a comparison failure instead of skipping the pair.
    pub strict_pairs: bool,
}

/// Pairs base and reference results and appends a `::compare` record for
/// every divergence found.
pub fn compare_results(results: &[CaseResult], opts: CompareOptions) -> Vec<CaseResult> {
    let suffix = match BackendKind::Llvm.id_suffix() {
        Some(s) => s,
        None => return Vec::new(),
    };

    let mut base: BTreeMap<&str, &CaseResult> = BTreeMap::new();
    let mut reference: BTreeMap<&str, &CaseResult> = BTreeMap::new();
    for r in results {
        if r.id.ends_with("::compare") {
            continue;
        }
        match r.id.strip_suffix(suffix) {
            Some(stem) => reference.insert(stem, r),
            None => base.insert(r.id.as_str(), r),
        };
    }

    let mut out = Vec::new();

    for (stem, rhs) in &reference {
        match base.get(stem) {
            Some(lhs) => {
                if let Some(record) = compare_pair(lhs, rhs) {
                    out.push(record);
                }
            }
            // Strict mode only flags results the comparator would actually
            // have used; an ineligible orphan is no information loss.
            None if opts.strict_pairs && eligible(rhs) => {
                out.push(divergence(
                    rhs,
                    "reference result has no base counterpart".to_string(),
                ));
            }
            None => debug!("no base counterpart for {stem}, skipping comparison"),
        }
    }

    if opts.strict_pairs {
        for (stem, lhs) in &base {
            if !reference.contains_key(stem) && eligible(lhs) {
                out.push(divergence(
                    lhs,
                    "base result has no reference counterpart".to_string(),
                ));
            }
        }
    }

    out
}

/// A result takes part in comparison only when it passed its run phase and
/// its expectations were not inverted: `compile_fail` and `should_panic`
/// cases observe diagnostic text that legitimately differs per backend.
fn eligible(r: &CaseResult) -> bool {
    r.status == Status::Pass
        && r.phase == Phase::Run
        && !r.tags.contains("compile_fail")
        && !r.tags.contains("should_panic")
}

/// Compares one base/reference pair. Returns a failure record on divergence,
/// `None` when the pair agrees or is ineligible.
fn compare_pair(lhs: &CaseResult, rhs: &CaseResult) -> Option<CaseResult> {
    if !eligible(lhs) || !eligible(rhs) {
        return None;
    }

    for (stream, a, b) in [
        ("stdout", &lhs.stdout, &rhs.stdout),
        ("stderr", &lhs.stderr, &rhs.stderr),
    ] {
        let a = normalize(a.as_deref().unwrap_or(""), &lhs.tags);
        let b = normalize(b.as_deref().unwrap_or(""), &lhs.tags);
        if a != b {
            return Some(divergence(
                lhs,
                format!("{stream} diverged: wasm produced {a:?}, llvm produced {b:?}"),
            ));
        }
    }

    None
}

fn divergence(base: &CaseResult, error: String) -> CaseResult {
    let stem = base
        .id
        .strip_suffix("::llvm")
        .unwrap_or(base.id.as_str());
    CaseResult {
        id: format!("{stem}::compare"),
        file: base.file.clone(),
        index: base.index,
        tags: base.tags.clone(),
        status: Status::Fail,
        phase: Phase::Compare,
        ok: false,
        stdout: None,
        stderr: None,
        error: Some(error),
        duration_ms: 0,
        worker: base.worker,
        dist_dir: None,
    }
}
