//! nepl-doctest: a doctest runner for the nepl language.
//!
//! Doctests are fenced code blocks embedded in `.n.md` documents and `//:`
//! doc comments in `.nepl` sources, announced by a `neplg2:test[...]`
//! marker. Each case is compiled, executed in a sandbox, and classified
//! against tag-driven expectations; a run produces one versioned JSON
//! report.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Extract**: Scan documents and sources for marked doctests
//! - **Backend**: Compile and run cases (in-process wasm, external llvm)
//! - **Pool**: Distribute cases across worker-owned backends
//! - **Compare**: Diff the two backends' observed behavior
//! - **Report**: Aggregate, order, and persist results
//! - **Analyze**: Bucket a report's failures by diagnostic shape
//!
//! # Example
//!
//! ```no_run
//! use nepl_doctest::extract::collect_cases;
//! use nepl_doctest::pool::WorkerPool;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let cases = collect_cases(&["docs".into()], &[])?;
//! let pool = WorkerPool::new(4);
//! // ... pick a backend factory, run, aggregate into a report ...
//! # Ok(())
//! # }
//! ```

pub mod analyze;
pub mod backend;
pub mod compare;
pub mod dist;
pub mod exec;
pub mod extract;
pub mod pool;
pub mod report;

// Re-export commonly used types
pub use backend::{Backend, BackendError, BackendKind, CompileOutcome, RunOutput};
pub use exec::{CaseExecutor, CaseResult, ExecOptions, Phase, Status};
pub use extract::{Doctest, TestCase, collect_cases};
pub use pool::WorkerPool;
pub use report::{Report, Summary};
