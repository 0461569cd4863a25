//! Report aggregation: the JSON document a run produces and the console
//! summary printed alongside it.
//!
//! The JSON layout is versioned through the `schema` field
//! (`neplg2-doctest/v1`); downstream tooling keys on it before reading
//! anything else. Result ordering is deterministic regardless of worker
//! scheduling: results are sorted by `(file, index, id)` before
//! serialization.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use console::style;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exec::{CaseResult, Status, strip_ansi};

/// Schema identifier written into every report.
pub const SCHEMA: &str = "neplg2-doctest/v1";

/// How many failing cases the console summary excerpts.
const SUMMARY_EXCERPTS: usize = 20;

/// Aggregate counts over one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
}

impl Summary {
    /// The process exit code the run should finish with.
    pub fn exit_code(&self) -> i32 {
        if self.failed + self.errored > 0 { 1 } else { 0 }
    }
}

/// Flags the run was invoked with, echoed for reproducibility.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunFlags {
    pub assert_io: bool,
    pub strict_pairs: bool,
    pub compile_only: bool,
    pub llvm_all: bool,
}

/// The complete run report.
#[derive(Debug, Serialize, Deserialize)]
pub struct Report {
    pub schema: String,
    /// RFC 3339 timestamp of report creation.
    pub generated_at: String,
    pub jobs: usize,
    /// Which backend selection produced this report: `wasm`, `llvm` or `all`.
    pub runner: String,
    pub flags: RunFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist_hint: Option<String>,
    /// Distinct compiler artifact directories the backends actually loaded.
    #[serde(default)]
    pub resolved_dist_dirs: Vec<String>,
    pub summary: Summary,
    pub results: Vec<CaseResult>,
}

impl Report {
    /// Builds a report from raw results, sorting them and computing the
    /// summary.
    pub fn new(
        mut results: Vec<CaseResult>,
        jobs: usize,
        runner: String,
        flags: RunFlags,
        dist_hint: Option<PathBuf>,
    ) -> Self {
        sort_results(&mut results);
        let resolved: BTreeSet<String> = results
            .iter()
            .filter_map(|r| r.dist_dir.clone())
            .collect();
        Self {
            schema: SCHEMA.to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            jobs,
            runner,
            flags,
            dist_hint: dist_hint.map(|p| p.display().to_string()),
            resolved_dist_dirs: resolved.into_iter().collect(),
            summary: summarize(&results),
            results,
        }
    }

    /// Serializes the report as pretty JSON to `path`, creating parent
    /// directories as needed.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json + "\n")?;
        info!("report written to {}", path.display());
        Ok(())
    }

    /// Prints the human-readable summary, excerpting the first few failing
    /// cases with ANSI stripped from their diagnostics.
    pub fn print_summary(&self) {
        let s = &self.summary;
        println!(
            "{} total, {} passed, {} failed, {} errored",
            s.total,
            style(s.passed).green(),
            style(s.failed).red(),
            style(s.errored).yellow(),
        );

        let failing: Vec<&CaseResult> = self
            .results
            .iter()
            .filter(|r| matches!(r.status, Status::Fail | Status::Error))
            .collect();
        for r in failing.iter().take(SUMMARY_EXCERPTS) {
            let label = match r.status {
                Status::Fail => style("FAIL").red(),
                _ => style("ERROR").yellow(),
            };
            let detail = r
                .error
                .as_deref()
                .map(|e| first_line(&strip_ansi(e)))
                .unwrap_or_default();
            println!("  {label} {} {}", r.id, style(detail).dim());
        }
        if failing.len() > SUMMARY_EXCERPTS {
            println!("  ... and {} more", failing.len() - SUMMARY_EXCERPTS);
        }
    }
}

/// Deterministic report order: provenance file, doctest index, then id so
/// the `::llvm` and `::compare` variants of a case sit next to it.
pub fn sort_results(results: &mut [CaseResult]) {
    results.sort_by(|a, b| {
        (a.file.as_str(), a.index, a.id.as_str()).cmp(&(b.file.as_str(), b.index, b.id.as_str()))
    });
}

/// Counts statuses. `skip` results count as errored so a silently skipped
/// case can never inflate the pass column.
pub fn summarize(results: &[CaseResult]) -> Summary {
    let mut summary = Summary {
        total: results.len(),
        passed: 0,
        failed: 0,
        errored: 0,
    };
    for r in results {
        match r.status {
            Status::Pass => summary.passed += 1,
            Status::Fail => summary.failed += 1,
            Status::Error | Status::Skip => summary.errored += 1,
        }
    }
    summary
}

/// Loads a previously written report.
pub fn read_report(path: &Path) -> io::Result<Report> {
    let text = std::fs::read_to_string(path)?;
    let report: Report = serde_json::from_str(&text)?;
    Ok(report)
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or("").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Phase;
    use std::collections::BTreeSet;

    fn result(id: &str, file: &str, index: usize, status: Status) -> CaseResult {
        CaseResult {
            id: id.to_string(),
            file: file.to_string(),
            index,
            tags: BTreeSet::new(),
            status,
            phase: Phase::Run,
            ok: status == Status::Pass,
            stdout: None,
            stderr: None,
            error: (status != Status::Pass).then(|| "boom".to_string()),
            duration_ms: 1,
            worker: 0,
            dist_dir: Some("/opt/dist".to_string()),
        }
    }

    #[test]
    fn test_sort_is_deterministic_and_groups_variants() {
        let mut results = vec![
            result("b.n.md::doctest#1::llvm", "b.n.md", 1, Status::Pass),
            result("a.n.md::doctest#2", "a.n.md", 2, Status::Pass),
            result("b.n.md::doctest#1", "b.n.md", 1, Status::Pass),
            result("a.n.md::doctest#1", "a.n.md", 1, Status::Pass),
        ];
        sort_results(&mut results);
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            [
                "a.n.md::doctest#1",
                "a.n.md::doctest#2",
                "b.n.md::doctest#1",
                "b.n.md::doctest#1::llvm",
            ]
        );
    }

    #[test]
    fn test_summary_counts_and_exit_code() {
        let results = vec![
            result("a::doctest#1", "a", 1, Status::Pass),
            result("a::doctest#2", "a", 2, Status::Fail),
            result("a::doctest#3", "a", 3, Status::Error),
            result("a::doctest#4", "a", 4, Status::Skip),
        ];
        let summary = summarize(&results);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errored, 2);
        assert_eq!(summary.exit_code(), 1);

        let clean = summarize(&[result("a::doctest#1", "a", 1, Status::Pass)]);
        assert_eq!(clean.exit_code(), 0);
    }

    #[test]
    fn test_report_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");

        let report = Report::new(
            vec![
                result("a::doctest#2", "a", 2, Status::Fail),
                result("a::doctest#1", "a", 1, Status::Pass),
            ],
            4,
            "wasm".to_string(),
            RunFlags::default(),
            Some(PathBuf::from("/opt/nepl")),
        );
        report.write(&path).unwrap();

        let loaded = read_report(&path).unwrap();
        assert_eq!(loaded.schema, SCHEMA);
        assert_eq!(loaded.summary, report.summary);
        assert_eq!(loaded.results[0].id, "a::doctest#1");
        assert_eq!(loaded.resolved_dist_dirs, vec!["/opt/dist".to_string()]);
        assert_eq!(loaded.dist_hint.as_deref(), Some("/opt/nepl"));
    }

    #[test]
    fn test_resolved_dist_dirs_are_distinct() {
        let report = Report::new(
            vec![
                result("a::doctest#1", "a", 1, Status::Pass),
                result("a::doctest#2", "a", 2, Status::Pass),
            ],
            1,
            "wasm".to_string(),
            RunFlags::default(),
            None,
        );
        assert_eq!(report.resolved_dist_dirs.len(), 1);
    }
}
