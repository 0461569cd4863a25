//! Compile/run backends.
//!
//! A backend turns doctest source into an executable artifact and runs it in
//! a sandbox, capturing stdout/stderr and trap status. Two implementations
//! share the contract:
//!
//! - [`wasm::WasmBackend`]: the fast path. The packaged compiler service is
//!   loaded in-process and artifacts execute under a WASI sandbox.
//! - [`llvm::LlvmBackend`]: the reference path. An external compiler binary
//!   is invoked per case and the linked native binary is executed as a
//!   subprocess.
//!
//! Compile failures are ordinary values ([`CompileOutcome::Failed`]), not
//! errors: the case executor's expectation logic (`compile_fail`) pattern
//! matches on the outcome. [`BackendError`] is reserved for infrastructure
//! problems (an unresolved dist directory, a missing toolchain) which must
//! never be attributed to the test case itself.

pub mod llvm;
pub mod wasm;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::dist::DistError;
use crate::extract::TestCase;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Infrastructure-level backend failures.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The compiler-service artifact directory could not be resolved.
    #[error(transparent)]
    Dist(#[from] DistError),

    /// The compiler service failed to load or initialize.
    #[error("failed to initialize compiler service: {0}")]
    Init(String),

    /// Spawning or driving an external tool failed.
    #[error("toolchain invocation failed: {0}")]
    Tool(String),

    /// I/O around temporary files or artifacts failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which backend produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process compiler service + WASI sandbox.
    Wasm,
    /// External reference compiler + native toolchain.
    Llvm,
}

impl BackendKind {
    /// The id suffix appended to results of the non-primary backend.
    pub fn id_suffix(self) -> Option<&'static str> {
        match self {
            BackendKind::Wasm => None,
            BackendKind::Llvm => Some("::llvm"),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Wasm => write!(f, "wasm"),
            BackendKind::Llvm => write!(f, "llvm"),
        }
    }
}

/// Outcome of a compilation attempt. A diagnostic is a value, not an error.
#[derive(Debug)]
pub enum CompileOutcome<A> {
    /// Compilation succeeded.
    Artifact(A),
    /// Compilation failed with a human-readable diagnostic.
    Failed { diagnostic: String },
}

/// Observable behavior of one sandboxed execution.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// `true` when the artifact aborted abnormally instead of returning
    /// control normally.
    pub trapped: bool,
    /// Diagnostic for the trap, when one is available.
    pub trap_reason: Option<String>,
}

/// One compiler backend behind a uniform compile/run contract.
///
/// Backends are owned exclusively by a single worker and are never shared,
/// so implementations may keep interior compiler state without locking.
#[async_trait]
pub trait Backend: Send {
    /// Compiled artifact type. The reference backend keeps its temporary
    /// directory alive inside the artifact so cleanup is tied to drop.
    type Artifact: Send;

    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// The artifact directory this backend loaded its compiler from, when
    /// applicable. Echoed into results for the report's resolved-dir list.
    fn dist_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Compiles a case's source text.
    async fn compile(&mut self, case: &TestCase) -> BackendResult<CompileOutcome<Self::Artifact>>;

    /// Runs a compiled artifact with the given stdin.
    async fn run(&mut self, artifact: &Self::Artifact, stdin: &str) -> BackendResult<RunOutput>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! A scripted backend for executor and pool tests.

    use std::collections::HashMap;

    use super::*;

    /// Scripted behavior for one case, keyed by case id.
    #[derive(Debug, Clone)]
    pub enum Script {
        CompileFail(&'static str),
        CompileInfraError(&'static str),
        Run {
            stdout: &'static str,
            stderr: &'static str,
            trapped: bool,
        },
        RunInfraError(&'static str),
    }

    pub struct MockBackend {
        pub scripts: HashMap<String, Script>,
        pub dist: Option<PathBuf>,
    }

    impl MockBackend {
        pub fn new(scripts: HashMap<String, Script>) -> Self {
            Self {
                scripts,
                dist: Some(PathBuf::from("/mock/dist")),
            }
        }

        fn script(&self, id: &str) -> Script {
            self.scripts.get(id).cloned().unwrap_or(Script::Run {
                stdout: "",
                stderr: "",
                trapped: false,
            })
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        type Artifact = Script;

        fn kind(&self) -> BackendKind {
            BackendKind::Wasm
        }

        fn dist_dir(&self) -> Option<PathBuf> {
            self.dist.clone()
        }

        async fn compile(
            &mut self,
            case: &TestCase,
        ) -> BackendResult<CompileOutcome<Script>> {
            match self.script(&case.id) {
                Script::CompileFail(diag) => Ok(CompileOutcome::Failed {
                    diagnostic: diag.to_string(),
                }),
                Script::CompileInfraError(msg) => Err(BackendError::Init(msg.to_string())),
                other => Ok(CompileOutcome::Artifact(other)),
            }
        }

        async fn run(&mut self, artifact: &Script, _stdin: &str) -> BackendResult<RunOutput> {
            match artifact {
                Script::Run {
                    stdout,
                    stderr,
                    trapped,
                } => Ok(RunOutput {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    trapped: *trapped,
                    trap_reason: trapped.then(|| "trap".to_string()),
                }),
                Script::RunInfraError(msg) => Err(BackendError::Tool(msg.to_string())),
                _ => unreachable!("compile-phase script reached run"),
            }
        }
    }
}
