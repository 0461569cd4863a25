//! Locating the packaged compiler-service artifact directory.
//!
//! The compiler service is built into a `dist` directory whose location
//! differs between CI (repository root) and local builds (`web/dist`). The
//! resolver enumerates candidates in priority order and takes the first one
//! that exists:
//!
//! 1. the `NEPL_DIST` environment override
//! 2. hint-derived paths (`hint`, `hint/dist`, `hint/web/dist`, plus
//!    suffix-swapped variants when the hint already names a dist dir)
//! 3. current-working-directory-relative defaults
//! 4. executable-relative defaults, so the runner works when invoked from a
//!    subdirectory of the repository

use std::path::{Component, Path, PathBuf};

/// Environment variable that forces the artifact directory.
pub const DIST_ENV: &str = "NEPL_DIST";

/// Resolution failure, kept distinguishable from test failures so callers
/// report it as an infra-level error.
#[derive(Debug, thiserror::Error)]
pub enum DistError {
    /// No candidate directory exists on disk.
    #[error("compiler dist directory not found; searched: {}", format_searched(.searched))]
    NotFound { searched: Vec<PathBuf> },
}

fn format_searched(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Enumerates candidate dist directories in priority order, deduplicated by
/// normalized absolute path.
pub fn candidate_dist_dirs(hint: Option<&Path>) -> Vec<PathBuf> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut base = Vec::new();

    if let Ok(env) = std::env::var(DIST_ENV) {
        if !env.is_empty() {
            base.push(PathBuf::from(env));
        }
    }

    if let Some(hint) = hint {
        let r = absolute(hint, &cwd);
        base.push(r.clone());
        base.push(r.join("dist"));
        base.push(r.join("web").join("dist"));

        // The hint may already point at a dist dir; add its sibling layout.
        if r.file_name().is_some_and(|n| n == "dist") {
            if let Some(parent) = r.parent() {
                base.push(parent.join("web").join("dist"));
                if parent.file_name().is_some_and(|n| n == "web") {
                    if let Some(gp) = parent.parent() {
                        base.push(gp.join("dist"));
                    }
                }
            }
        }
    }

    base.push(cwd.join("dist"));
    base.push(cwd.join("web").join("dist"));
    base.push(cwd.join("..").join("dist"));
    base.push(cwd.join("..").join("web").join("dist"));

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        base.push(exe_dir.join("..").join("dist"));
        base.push(exe_dir.join("..").join("web").join("dist"));
        base.push(exe_dir.join("..").join("..").join("dist"));
        base.push(exe_dir.join("..").join("..").join("web").join("dist"));
    }

    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for p in base {
        let n = normalize(&absolute(&p, &cwd));
        if seen.insert(n.clone()) {
            out.push(n);
        }
    }
    out
}

/// Returns the first existing candidate directory.
pub fn resolve_dist_dir(hint: Option<&Path>) -> Result<PathBuf, DistError> {
    let searched = candidate_dist_dirs(hint);
    for dir in &searched {
        if dir.is_dir() {
            return Ok(dir.clone());
        }
    }
    Err(DistError::NotFound { searched })
}

fn absolute(p: &Path, cwd: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    }
}

/// Lexically removes `.` and `..` components so equivalent candidates
/// deduplicate without touching the filesystem.
fn normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
