//! The fast in-process backend.
//!
//! The packaged compiler service lives in the resolved dist directory as a
//! `nepl-web-*_bg.wasm` module. It is instantiated once per worker under
//! wasmtime with a WASI preview1 linker and driven through a small C-style
//! entry-point contract:
//!
//! - `nepl_alloc(len: i32) -> ptr`: guest-side request buffer
//! - `nepl_compile_source(ptr, len) -> ptr`: compiles UTF-8 source text;
//!   the returned pointer addresses a 12-byte header
//!   `{status: i32, payload_ptr: i32, payload_len: i32}` (little-endian).
//!   Status 0 carries wasm artifact bytes, anything else a UTF-8 diagnostic.
//! - `nepl_compile_source_with_vfs(ptr, len) -> ptr`: optional; same header,
//!   but the request is a JSON object `{entry, source, files}` carrying a
//!   virtual filesystem for doctests that import neighboring files.
//!
//! The optional entry point is probed exactly once when the backend is
//! constructed; when it is absent the backend degrades to the base call.
//!
//! Compiled artifacts are executed in a fresh WASI store per case, with
//! stdin/stdout/stderr wired to in-memory pipes. A trap is a wasm trap, a
//! non-zero `proc_exit`, or a failure to start the module.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;
use wasmtime::{Engine, Linker, Memory, Module, Store, TypedFunc};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use super::{Backend, BackendError, BackendKind, BackendResult, CompileOutcome, RunOutput};
use crate::dist::resolve_dist_dir;
use crate::extract::TestCase;

/// Upper bound on captured stdout/stderr per execution.
const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Virtual path under which a doctest's own source is compiled.
const VIRTUAL_ENTRY: &str = "/virtual/entry.nepl";

/// A compiled doctest: raw wasm bytes produced by the compiler service.
#[derive(Debug)]
pub struct WasmArtifact {
    pub bytes: Vec<u8>,
}

/// In-process compiler service plus WASI execution sandbox.
pub struct WasmBackend {
    engine: Engine,
    dist_dir: PathBuf,
    store: Store<WasiP1Ctx>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    compile_source: TypedFunc<(i32, i32), i32>,
    compile_source_with_vfs: Option<TypedFunc<(i32, i32), i32>>,
}

impl WasmBackend {
    /// Resolves the dist directory and loads the compiler-service module.
    pub fn new(dist_hint: Option<&Path>) -> BackendResult<Self> {
        let dist_dir = resolve_dist_dir(dist_hint)?;
        let module_path = pick_compiler_module(&dist_dir)?;
        debug!("loading compiler service from {}", module_path.display());

        let engine = Engine::default();
        let module = Module::from_file(&engine, &module_path)
            .map_err(|e| BackendError::Init(format!("{}: {e}", module_path.display())))?;

        let mut linker: Linker<WasiP1Ctx> = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |cx| cx)
            .map_err(|e| BackendError::Init(e.to_string()))?;

        // The compiler service gets no stdio of its own; anything it prints
        // must not leak into doctest output.
        let wasi = WasiCtxBuilder::new().build_p1();
        let mut store = Store::new(&engine, wasi);

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| BackendError::Init(format!("instantiate compiler service: {e}")))?;

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ())
                .map_err(|e| BackendError::Init(format!("_initialize: {e}")))?;
        }

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| BackendError::Init("compiler service exports no memory".into()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "nepl_alloc")
            .map_err(|e| BackendError::Init(format!("nepl_alloc: {e}")))?;
        let compile_source = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "nepl_compile_source")
            .map_err(|e| BackendError::Init(format!("nepl_compile_source: {e}")))?;
        // Optional capability, probed once here rather than per call.
        let compile_source_with_vfs = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "nepl_compile_source_with_vfs")
            .ok();

        Ok(Self {
            engine,
            dist_dir,
            store,
            memory,
            alloc,
            compile_source,
            compile_source_with_vfs,
        })
    }

    /// Invokes a compile entry point. Guest-side faults (including compiler
    /// panics) are reported as compile diagnostics, not infra errors, so a
    /// crashing compiler shows up attached to the case that triggered it.
    fn invoke_compile(
        &mut self,
        entry: TypedFunc<(i32, i32), i32>,
        request: &[u8],
    ) -> CompileOutcome<WasmArtifact> {
        match self.invoke_compile_inner(entry, request) {
            Ok(outcome) => outcome,
            Err(e) => CompileOutcome::Failed {
                diagnostic: format!("compiler service fault: {e:#}"),
            },
        }
    }

    fn invoke_compile_inner(
        &mut self,
        entry: TypedFunc<(i32, i32), i32>,
        request: &[u8],
    ) -> anyhow::Result<CompileOutcome<WasmArtifact>> {
        let len = i32::try_from(request.len())?;
        let ptr = self.alloc.call(&mut self.store, len)?;
        self.memory
            .write(&mut self.store, ptr as usize, request)?;

        let header_ptr = entry.call(&mut self.store, (ptr, len))?;

        let mut header = [0u8; 12];
        self.memory
            .read(&self.store, header_ptr as usize, &mut header)?;
        let status = i32::from_le_bytes(header[0..4].try_into().unwrap());
        let payload_ptr = i32::from_le_bytes(header[4..8].try_into().unwrap());
        let payload_len = i32::from_le_bytes(header[8..12].try_into().unwrap());

        let mut payload = vec![0u8; payload_len as usize];
        self.memory
            .read(&self.store, payload_ptr as usize, &mut payload)?;

        if status == 0 {
            Ok(CompileOutcome::Artifact(WasmArtifact { bytes: payload }))
        } else {
            Ok(CompileOutcome::Failed {
                diagnostic: String::from_utf8_lossy(&payload).into_owned(),
            })
        }
    }
}

#[async_trait]
impl Backend for WasmBackend {
    type Artifact = WasmArtifact;

    fn kind(&self) -> BackendKind {
        BackendKind::Wasm
    }

    fn dist_dir(&self) -> Option<PathBuf> {
        Some(self.dist_dir.clone())
    }

    async fn compile(&mut self, case: &TestCase) -> BackendResult<CompileOutcome<WasmArtifact>> {
        let vfs = collect_vfs_sources(&case.source, Path::new(&case.file));

        let outcome = match (self.compile_source_with_vfs.clone(), vfs.is_empty()) {
            (Some(entry), false) => {
                let request = serde_json::json!({
                    "entry": VIRTUAL_ENTRY,
                    "source": case.source,
                    "files": vfs,
                });
                self.invoke_compile(entry, request.to_string().as_bytes())
            }
            _ => {
                let entry = self.compile_source.clone();
                self.invoke_compile(entry, case.source.as_bytes())
            }
        };
        Ok(outcome)
    }

    async fn run(&mut self, artifact: &WasmArtifact, stdin: &str) -> BackendResult<RunOutput> {
        let stdout_pipe = MemoryOutputPipe::new(MAX_OUTPUT_BYTES);
        let stderr_pipe = MemoryOutputPipe::new(MAX_OUTPUT_BYTES);
        let wasi = WasiCtxBuilder::new()
            .stdin(MemoryInputPipe::new(stdin.as_bytes().to_vec()))
            .stdout(stdout_pipe.clone())
            .stderr(stderr_pipe.clone())
            .build_p1();
        let mut store = Store::new(&self.engine, wasi);

        let (trapped, trap_reason) = match execute(&self.engine, &mut store, &artifact.bytes) {
            Ok(()) => (false, None),
            Err(e) => match e.downcast_ref::<I32Exit>() {
                Some(I32Exit(0)) => (false, None),
                Some(I32Exit(code)) => (true, Some(format!("exit status {code}"))),
                None => (true, Some(format!("{e:#}"))),
            },
        };

        drop(store);
        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&stdout_pipe.contents()).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_pipe.contents()).into_owned(),
            trapped,
            trap_reason,
        })
    }
}

fn execute(engine: &Engine, store: &mut Store<WasiP1Ctx>, bytes: &[u8]) -> anyhow::Result<()> {
    let module = Module::new(engine, bytes)?;
    let mut linker: Linker<WasiP1Ctx> = Linker::new(engine);
    preview1::add_to_linker_sync(&mut linker, |cx| cx)?;
    let instance = linker.instantiate(&mut *store, &module)?;
    let start = instance.get_typed_func::<(), ()>(&mut *store, "_start")?;
    start.call(store, ())?;
    Ok(())
}

/// Finds the compiler-service module inside a dist directory.
///
/// Takes the lexicographically first `nepl-web-*_bg.wasm` so a dist dir with
/// stale hashed builds still resolves deterministically.
fn pick_compiler_module(dist_dir: &Path) -> BackendResult<PathBuf> {
    let mut candidates: Vec<String> = std::fs::read_dir(dist_dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with("nepl-web-") && n.ends_with("_bg.wasm"))
        .collect();
    candidates.sort();
    match candidates.into_iter().next() {
        Some(name) => Ok(dist_dir.join(name)),
        None => Err(BackendError::Init(format!(
            "nepl-web-*_bg.wasm not found in dist: {}",
            dist_dir.display()
        ))),
    }
}

static IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*#(?:import|include)\s+"([^"]+)""#).unwrap());

/// Extracts `#import`/`#include` specs from source text.
fn extract_import_specs(source: &str) -> Vec<String> {
    IMPORT_RE
        .captures_iter(source)
        .map(|c| c[1].to_string())
        .collect()
}

/// Resolves an import spec within the virtual namespace (always `/`-separated).
fn resolve_virtual_import(from_virtual: &str, spec: &str) -> String {
    let joined = if spec.starts_with('/') {
        spec.to_string()
    } else {
        let base = match from_virtual.rfind('/') {
            Some(idx) => &from_virtual[..idx],
            None => "",
        };
        format!("{base}/{spec}")
    };
    let with_ext = if joined.rsplit('/').next().is_some_and(|n| n.contains('.')) {
        joined
    } else {
        format!("{joined}.nepl")
    };

    // Lexical normalization of ./ and ../ segments.
    let mut parts: Vec<&str> = Vec::new();
    for seg in with_ext.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

fn resolve_real_import(from_dir: &Path, spec: &str) -> PathBuf {
    let mut out = if spec.starts_with('/') {
        PathBuf::from(spec)
    } else {
        from_dir.join(spec)
    };
    if out.extension().is_none() {
        out.set_extension("nepl");
    }
    out
}

/// Builds the virtual filesystem a doctest needs: every relative or absolute
/// `#import`/`#include` reachable from the doctest's own document directory,
/// read from disk transitively. Unresolvable specs are skipped; the compiler
/// reports them in its own diagnostics.
fn collect_vfs_sources(entry_source: &str, case_file: &Path) -> BTreeMap<String, String> {
    let mut vfs = BTreeMap::new();
    let Some(root_dir) = case_file.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return vfs;
    };

    let mut queue = vec![(
        entry_source.to_string(),
        root_dir.to_path_buf(),
        VIRTUAL_ENTRY.to_string(),
    )];

    while let Some((source, real_dir, virtual_file)) = queue.pop() {
        for spec in extract_import_specs(&source) {
            if !(spec.starts_with("./") || spec.starts_with("../") || spec.starts_with('/')) {
                continue;
            }
            let virtual_path = resolve_virtual_import(&virtual_file, &spec);
            if vfs.contains_key(&virtual_path) {
                continue;
            }
            let real_path = resolve_real_import(&real_dir, &spec);
            let Ok(content) = std::fs::read_to_string(&real_path) else {
                continue;
            };
            let next_dir = real_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| real_dir.clone());
            vfs.insert(virtual_path.clone(), content.clone());
            queue.push((content, next_dir, virtual_path));
        }
    }

    vfs
}
