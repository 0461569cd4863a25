//! The reference external-process backend.
//!
//! Each case is compiled by the external `nepl-cli` binary
//! (`--target llvm --input <src> --output <obj>`), linked with the native
//! toolchain, and executed as a native subprocess with the case's stdin piped
//! in. Everything happens inside a per-case temporary directory owned by the
//! artifact, so the directory and its contents are removed when the artifact
//! drops, on every exit path including compile and link failures.
//!
//! Environment overrides: `NEPL_CLI` for the compiler binary, `NEPL_CC` for
//! the native toolchain (default `cc`).

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Backend, BackendError, BackendKind, BackendResult, CompileOutcome, RunOutput};
use crate::extract::TestCase;

/// Environment variable overriding the reference compiler binary.
pub const CLI_ENV: &str = "NEPL_CLI";
/// Environment variable overriding the native toolchain binary.
pub const CC_ENV: &str = "NEPL_CC";

/// An object file plus the temporary directory that owns it. Dropping the
/// artifact removes the directory.
#[derive(Debug)]
pub struct LlvmArtifact {
    dir: TempDir,
    object: PathBuf,
}

/// External-process reference backend.
pub struct LlvmBackend {
    compiler: String,
    cc: String,
}

impl LlvmBackend {
    /// Creates a backend using the `NEPL_CLI`/`NEPL_CC` overrides when set.
    pub fn from_env() -> Self {
        Self {
            compiler: std::env::var(CLI_ENV).unwrap_or_else(|_| "nepl-cli".to_string()),
            cc: std::env::var(CC_ENV).unwrap_or_else(|_| "cc".to_string()),
        }
    }
}

#[async_trait]
impl Backend for LlvmBackend {
    type Artifact = LlvmArtifact;

    fn kind(&self) -> BackendKind {
        BackendKind::Llvm
    }

    async fn compile(&mut self, case: &TestCase) -> BackendResult<CompileOutcome<LlvmArtifact>> {
        let dir = tempfile::Builder::new().prefix("nepl-doctest").tempdir()?;
        let source_path = dir.path().join("case.nepl");
        let object_path = dir.path().join("case.o");
        tokio::fs::write(&source_path, &case.source).await?;

        debug!("compiling {} with {}", case.id, self.compiler);
        let output = tokio::process::Command::new(&self.compiler)
            .arg("--target")
            .arg("llvm")
            .arg("--input")
            .arg(&source_path)
            .arg("--output")
            .arg(&object_path)
            .output()
            .await
            .map_err(|e| BackendError::Tool(format!("spawn {}: {e}", self.compiler)))?;

        if !output.status.success() {
            let diagnostic = String::from_utf8_lossy(&output.stderr).into_owned();
            return Ok(CompileOutcome::Failed {
                diagnostic: if diagnostic.is_empty() {
                    format!("{} exited with {}", self.compiler, output.status)
                } else {
                    diagnostic
                },
            });
        }

        Ok(CompileOutcome::Artifact(LlvmArtifact {
            dir,
            object: object_path,
        }))
    }

    async fn run(&mut self, artifact: &LlvmArtifact, stdin: &str) -> BackendResult<RunOutput> {
        // Link step. A broken toolchain is an infra error, never a test
        // failure.
        let binary = artifact.dir.path().join("case.bin");
        let link = tokio::process::Command::new(&self.cc)
            .arg(&artifact.object)
            .arg("-o")
            .arg(&binary)
            .output()
            .await
            .map_err(|e| BackendError::Tool(format!("spawn {}: {e}", self.cc)))?;
        if !link.status.success() {
            return Err(BackendError::Tool(format!(
                "link failed: {}",
                String::from_utf8_lossy(&link.stderr)
            )));
        }

        let mut child = tokio::process::Command::new(&binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::Tool(format!("spawn {}: {e}", binary.display())))?;

        if let Some(mut pipe) = child.stdin.take() {
            // The child may exit without draining stdin; a broken pipe here
            // is part of normal trap behavior, not an infra error.
            let _ = pipe.write_all(stdin.as_bytes()).await;
            let _ = pipe.shutdown().await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::Tool(format!("wait: {e}")))?;

        let (trapped, trap_reason) = match output.status.code() {
            Some(0) => (false, None),
            Some(code) => (true, Some(format!("exit status {code}"))),
            None => (true, Some(format!("terminated by signal: {}", output.status))),
        };

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            trapped,
            trap_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn case(source: &str) -> TestCase {
        TestCase {
            id: "t.n.md::doctest#1".to_string(),
            file: "t.n.md".to_string(),
            index: 1,
            tags: BTreeSet::new(),
            source: source.to_string(),
            stdin: String::new(),
            expected_stdout: None,
            expected_stderr: None,
        }
    }

    #[tokio::test]
    async fn test_missing_compiler_is_infra_error() {
        let mut backend = LlvmBackend {
            compiler: "/nonexistent/nepl-cli".to_string(),
            cc: "cc".to_string(),
        };
        match backend.compile(&case("print 1\n")).await {
            Err(BackendError::Tool(msg)) => assert!(msg.contains("spawn")),
            other => panic!("expected infra error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_compiler_is_compile_failure() {
        // `false` accepts any arguments and exits non-zero, standing in for
        // a compiler that rejects the source.
        let mut backend = LlvmBackend {
            compiler: "false".to_string(),
            cc: "cc".to_string(),
        };
        match backend.compile(&case("bad source\n")).await.unwrap() {
            CompileOutcome::Failed { diagnostic } => {
                assert!(diagnostic.contains("exited with"));
            }
            CompileOutcome::Artifact(_) => panic!("expected compile failure"),
        }
    }
}
