//! Per-case execution: the compile → run → expectation state machine.
//!
//! Execution is strictly linear: a failed compile is never retried, a trapped
//! run is terminal. Tags invert or suppress expectations:
//!
//! - `skip`: report pass without compiling or running
//! - `compile_fail`: the case passes iff compilation fails
//! - `should_panic`: the case passes iff the run traps
//! - `analysis`: compile-only static-analysis case, reported as
//!   `phase=analysis`
//! - `assert_io`: compare captured output against declared expectations
//!   (also enabled globally by a runner flag)
//! - `normalize_newlines`, `strip_ansi`: normalization applied before
//!   output comparison
//!
//! Infrastructure failures surface as `status=error` and are never conflated
//! with test failures.

use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, CompileOutcome, RunOutput};
use crate::extract::TestCase;

/// Outcome classification of one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Expectations held.
    Pass,
    /// The case ran but an expectation was not met.
    Fail,
    /// Infrastructure failed; the case could not be judged.
    Error,
    /// The case was deliberately not executed.
    Skip,
}

/// The pipeline stage that determined the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Run,
    Compare,
    Analysis,
    Skip,
}

/// Outcome of attempting to satisfy one test case against one backend.
///
/// Created once and never mutated; the IO-assertion downgrade constructs a
/// new record rather than editing the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    /// Case id, with a backend suffix (e.g. `::llvm`) when dual-tracking.
    pub id: String,
    /// Provenance document, used for deterministic report ordering.
    pub file: String,
    /// 1-based doctest index within the document.
    pub index: usize,
    /// Tags echoed from the case; the comparator reads normalization tags
    /// from here.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub status: Status,
    pub phase: Phase,
    /// `true` exactly when `status` is `pass`.
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Human-readable diagnostic when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Id of the worker that produced this result. Diagnostic only.
    pub worker: usize,
    /// Compiler artifact directory this result was produced with, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist_dir: Option<String>,
}

/// Executor configuration shared by every case of a run.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Assert declared stdin/stdout expectations for every case, not just
    /// those tagged `assert_io`.
    pub assert_io: bool,
    /// Stop after a successful compile; never link or run.
    pub compile_only: bool,
    /// Appended to result ids, e.g. `::llvm` for the reference backend.
    pub id_suffix: Option<String>,
}

/// Runs single cases against one backend.
pub struct CaseExecutor<'a, B: Backend> {
    backend: &'a mut B,
    opts: &'a ExecOptions,
    worker: usize,
}

/// Intermediate outcome before the common fields are stamped on.
struct Judgement {
    status: Status,
    phase: Phase,
    stdout: Option<String>,
    stderr: Option<String>,
    error: Option<String>,
}

impl Judgement {
    fn new(status: Status, phase: Phase) -> Self {
        Self {
            status,
            phase,
            stdout: None,
            stderr: None,
            error: None,
        }
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    fn with_output(mut self, out: &RunOutput) -> Self {
        self.stdout = Some(out.stdout.clone());
        self.stderr = Some(out.stderr.clone());
        self
    }
}

impl<'a, B: Backend> CaseExecutor<'a, B> {
    pub fn new(backend: &'a mut B, opts: &'a ExecOptions, worker: usize) -> Self {
        Self {
            backend,
            opts,
            worker,
        }
    }

    /// Executes one case end to end and produces its result record.
    pub async fn execute(&mut self, case: &TestCase) -> CaseResult {
        let start = Instant::now();
        let judgement = self.judge(case).await;

        let mut id = case.id.clone();
        if let Some(suffix) = &self.opts.id_suffix {
            id.push_str(suffix);
        }

        CaseResult {
            id,
            file: case.file.clone(),
            index: case.index,
            tags: case.tags.clone(),
            ok: judgement.status == Status::Pass,
            status: judgement.status,
            phase: judgement.phase,
            stdout: judgement.stdout,
            stderr: judgement.stderr,
            error: judgement.error,
            duration_ms: start.elapsed().as_millis() as u64,
            worker: self.worker,
            dist_dir: self
                .backend
                .dist_dir()
                .map(|p| p.display().to_string()),
        }
    }

    async fn judge(&mut self, case: &TestCase) -> Judgement {
        if case.has_tag("skip") {
            return Judgement::new(Status::Pass, Phase::Skip);
        }

        let analysis = case.has_tag("analysis");
        let compile_phase = if analysis {
            Phase::Analysis
        } else {
            Phase::Compile
        };

        let artifact = match self.backend.compile(case).await {
            Err(e) => {
                return Judgement::new(Status::Error, compile_phase).with_error(e.to_string());
            }
            Ok(CompileOutcome::Failed { diagnostic }) => {
                return if case.has_tag("compile_fail") {
                    Judgement::new(Status::Pass, compile_phase)
                } else {
                    Judgement::new(Status::Fail, compile_phase).with_error(diagnostic)
                };
            }
            Ok(CompileOutcome::Artifact(artifact)) => {
                if case.has_tag("compile_fail") {
                    return Judgement::new(Status::Fail, compile_phase)
                        .with_error("expected compile_fail, but compiled successfully");
                }
                artifact
            }
        };

        if analysis {
            return Judgement::new(Status::Pass, Phase::Analysis);
        }
        if self.opts.compile_only {
            return Judgement::new(Status::Pass, Phase::Compile);
        }

        let out = match self.backend.run(&artifact, &case.stdin).await {
            Ok(out) => out,
            Err(e) => {
                return Judgement::new(Status::Error, Phase::Run).with_error(e.to_string());
            }
        };

        if case.has_tag("should_panic") {
            return if out.trapped {
                Judgement::new(Status::Pass, Phase::Run).with_output(&out)
            } else {
                Judgement::new(Status::Fail, Phase::Run)
                    .with_output(&out)
                    .with_error("expected should_panic, but program finished without trap")
            };
        }

        if out.trapped {
            let reason = out
                .trap_reason
                .clone()
                .unwrap_or_else(|| "program trapped".to_string());
            return Judgement::new(Status::Fail, Phase::Run)
                .with_output(&out)
                .with_error(reason);
        }

        let judgement = Judgement::new(Status::Pass, Phase::Run).with_output(&out);
        self.assert_io(case, judgement, &out)
    }

    /// Applies declared IO expectations to an otherwise-passing run. Any
    /// mismatch downgrades the result; it is never silently dropped.
    fn assert_io(&self, case: &TestCase, judgement: Judgement, out: &RunOutput) -> Judgement {
        if !(self.opts.assert_io || case.has_tag("assert_io")) {
            return judgement;
        }

        for (stream, expected, actual) in [
            ("stdout", &case.expected_stdout, &out.stdout),
            ("stderr", &case.expected_stderr, &out.stderr),
        ] {
            let Some(expected) = expected else { continue };
            let expected = normalize(expected, &case.tags);
            let actual = normalize(actual, &case.tags);
            if expected != actual {
                return Judgement::new(Status::Fail, Phase::Run)
                    .with_output(out)
                    .with_error(format!(
                        "{stream} mismatch: expected {expected:?}, got {actual:?}"
                    ));
            }
        }

        judgement
    }
}

static SGR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());

/// Removes SGR (color/style) escape sequences.
pub fn strip_ansi(s: &str) -> String {
    SGR_RE.replace_all(s, "").into_owned()
}

/// Collapses CRLF and lone CR line endings to LF.
pub fn normalize_newlines(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Applies the normalization steps a case's tags request.
pub fn normalize(s: &str, tags: &BTreeSet<String>) -> String {
    let mut out = s.to_string();
    if tags.contains("normalize_newlines") {
        out = normalize_newlines(&out);
    }
    if tags.contains("strip_ansi") {
        out = strip_ansi(&out);
    }
    out
}
