//! Doctest extraction from documentation-bearing source files.
//!
//! Two document dialects carry doctests:
//!
//! - `.n.md`: extended markdown; doctest markers and fences appear directly
//!   in the text.
//! - `.nepl`: compiler source; only lines prefixed with the documentation
//!   comment marker `//:` participate, and `//:|` marks a hidden line.
//!
//! A doctest is a `neplg2:test[tag,...]` marker line, optional
//! `stdin:`/`stdout:`/`stderr:` metadata lines, and the next ```` ```neplg2 ````
//! fenced block. Inside the fence a leading `|` marks a line that stays in the
//! compiled source but is elided when the document is rendered.
//!
//! The scan is deliberately lenient: a marker with no following fence, or a
//! fence that never closes, drops that case silently rather than failing the
//! whole document. Documentation prose routinely contains incidental
//! triple-backtick text that is not a real doctest.

pub mod meta;

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;

/// Errors that can occur while reading or walking input documents.
///
/// Malformed doctests are never errors; only filesystem-level problems
/// surface here.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Failed to read a document file.
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    /// Failed to list a directory while walking an input root.
    #[error("failed to walk {path}: {source}")]
    Walk { path: PathBuf, source: io::Error },
}

/// Document dialect, selected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `.n.md`: extended markdown.
    Markdown,
    /// `.nepl`: compiler source with `//:` documentation comments.
    Source,
}

impl Dialect {
    /// Selects the dialect for a file path, or `None` for files that cannot
    /// carry doctests.
    pub fn for_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".n.md") {
            Some(Dialect::Markdown)
        } else if name.ends_with(".nepl") {
            Some(Dialect::Source)
        } else {
            None
        }
    }
}

/// One doctest as extracted from a document, before case ids are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Doctest {
    /// Expectation-policy tags; order-insensitive, duplicates collapsed.
    pub tags: BTreeSet<String>,
    /// Code to compile: newline-joined stripped lines plus a trailing newline.
    pub code: String,
    /// Per-line flags: `true` for lines the renderer should elide.
    pub hidden: Vec<bool>,
    /// Text fed to the executed artifact, when declared.
    pub stdin: Option<String>,
    /// Expected stdout; `None` means not asserted.
    pub stdout: Option<String>,
    /// Expected stderr; `None` means not asserted.
    pub stderr: Option<String>,
}

/// One executable unit scheduled for a run.
///
/// Created once per extraction pass and immutable thereafter; executors read
/// cases, they never write them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Stable id: `<file path>::doctest#<1-based index>`.
    pub id: String,
    /// Provenance: the document the case came from.
    pub file: String,
    /// 1-based index of the doctest within its document.
    pub index: usize,
    /// Expectation-policy tags.
    pub tags: BTreeSet<String>,
    /// Source text to compile.
    pub source: String,
    /// Stdin for the executed artifact; empty if unspecified.
    #[serde(default)]
    pub stdin: String,
    /// Expected stdout, when asserted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_stdout: Option<String>,
    /// Expected stderr, when asserted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_stderr: Option<String>,
}

impl TestCase {
    /// Returns `true` if the case carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*neplg2:test(?:\[([^\]]+)\])?\s*$").unwrap());
static FENCE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*```\s*neplg2\s*$").unwrap());
static FENCE_CLOSE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*```\s*$").unwrap());
static META_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(stdin|stdout|stderr):\s*(.*)$").unwrap());

/// Extracts every well-formed doctest from a document.
pub fn extract_text(text: &str, dialect: Dialect) -> Vec<Doctest> {
    let normalized = text.replace("\r\n", "\n");
    let lines: Vec<&str> = normalized.split('\n').collect();
    match dialect {
        Dialect::Markdown => scan(&lines, |raw| raw.to_string(), |raw| raw.starts_with('|')),
        Dialect::Source => scan(&lines, source_doc_line, source_is_hidden),
    }
}

/// Scans lines for marker + fence pairs.
///
/// `transform` maps a raw line to its doctest-visible text (the identity for
/// markdown; comment stripping for source files). `is_hidden` is evaluated on
/// the raw line so the source dialect can flag `//:|` lines.
fn scan(
    lines: &[&str],
    transform: impl Fn(&str) -> String,
    is_hidden: impl Fn(&str) -> bool,
) -> Vec<Doctest> {
    let mut doctests = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = transform(lines[i]);
        let Some(caps) = MARKER_RE.captures(&line) else {
            i += 1;
            continue;
        };
        let tags = parse_tags(caps.get(1).map(|m| m.as_str()).unwrap_or(""));

        // Metadata lines live between the marker and the fence open.
        let mut stdin = None;
        let mut stdout = None;
        let mut stderr = None;
        let mut j = i + 1;
        let mut found_fence = false;
        while j < lines.len() {
            let l = transform(lines[j]);
            if FENCE_OPEN_RE.is_match(&l) {
                found_fence = true;
                break;
            }
            if let Some(m) = META_RE.captures(&l) {
                let value = meta::parse_value(&m[2]);
                match &m[1] {
                    "stdin" => stdin = value,
                    "stdout" => stdout = value,
                    "stderr" => stderr = value,
                    _ => unreachable!(),
                }
            }
            j += 1;
        }
        if !found_fence {
            debug!("doctest marker without a following fence dropped");
            i += 1;
            continue;
        }

        // Collect the fence body.
        j += 1;
        let mut code_lines = Vec::new();
        let mut hidden = Vec::new();
        let mut closed = false;
        while j < lines.len() {
            let raw = lines[j];
            let l = transform(raw);
            if FENCE_CLOSE_RE.is_match(&l) {
                closed = true;
                break;
            }
            hidden.push(is_hidden(raw));
            code_lines.push(strip_hidden_prefix(&l).to_string());
            j += 1;
        }
        if !closed {
            debug!("unclosed doctest fence dropped");
            i = j;
            continue;
        }

        doctests.push(Doctest {
            tags,
            code: code_lines.join("\n") + "\n",
            hidden,
            stdin,
            stdout,
            stderr,
        });
        i = j + 1;
    }

    doctests
}

fn parse_tags(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// `"| xxx"` or `"|xxx"` becomes `"xxx"`: the line is compiled but elided
/// from rendered documentation.
fn strip_hidden_prefix(line: &str) -> &str {
    match line.strip_prefix('|') {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
        None => line,
    }
}

/// Maps a raw `.nepl` line to its documentation text. Non-doc lines map to
/// the empty string, which never opens or closes a fence.
fn source_doc_line(raw: &str) -> String {
    let Some(rest) = raw.trim_start().strip_prefix("//:") else {
        return String::new();
    };
    let (hidden, rest) = match rest.strip_prefix('|') {
        Some(r) => (true, r),
        None => (false, rest),
    };
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    if hidden {
        format!("|{rest}")
    } else {
        rest.to_string()
    }
}

fn source_is_hidden(raw: &str) -> bool {
    raw.trim_start().starts_with("//:|")
}

/// Extracts the doctests of one file, returning an empty list for files of
/// neither dialect.
pub fn extract_file(path: &Path) -> ExtractResult<Vec<Doctest>> {
    let Some(dialect) = Dialect::for_path(path) else {
        return Ok(Vec::new());
    };
    let text = std::fs::read_to_string(path).map_err(|source| ExtractError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(extract_text(&text, dialect))
}

/// Collects all test cases under the given input roots.
///
/// Each root may be a single document or a directory walked recursively.
/// Directories whose name appears in `exclude_dirs` are pruned. Entries are
/// visited in sorted order so case ids are deterministic across runs.
pub fn collect_cases(roots: &[PathBuf], exclude_dirs: &[String]) -> ExtractResult<Vec<TestCase>> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut cases = Vec::new();

    for root in roots {
        let mut files = Vec::new();
        if root.is_file() {
            files.push(root.clone());
        } else if root.is_dir() {
            walk_files(root, exclude_dirs, &mut files)?;
        } else {
            warn!("input not found: {}", root.display());
            continue;
        }

        for file in files {
            if Dialect::for_path(&file).is_none() {
                continue;
            }
            let rel = file.strip_prefix(&cwd).unwrap_or(&file);
            let rel = rel.display().to_string();
            for (i, dt) in extract_file(&file)?.into_iter().enumerate() {
                let index = i + 1;
                cases.push(TestCase {
                    id: format!("{rel}::doctest#{index}"),
                    file: rel.clone(),
                    index,
                    tags: dt.tags,
                    source: dt.code,
                    stdin: dt.stdin.unwrap_or_default(),
                    expected_stdout: dt.stdout,
                    expected_stderr: dt.stderr,
                });
            }
        }
    }

    Ok(cases)
}

fn walk_files(dir: &Path, exclude_dirs: &[String], out: &mut Vec<PathBuf>) -> ExtractResult<()> {
    let entries = std::fs::read_dir(dir).map_err(|source| ExtractError::Walk {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut entries: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if exclude_dirs.iter().any(|d| d == name) {
                continue;
            }
            walk_files(&path, exclude_dirs, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(text: &str) -> Vec<Doctest> {
        extract_text(text, Dialect::Markdown)
    }

    #[test]
    fn test_extract_basic_doctest() {
        let doc = "# Title\n\nneplg2:test\n```neplg2\nprint 1\n```\n";
        let dts = md(doc);
        assert_eq!(dts.len(), 1);
        assert_eq!(dts[0].code, "print 1\n");
        assert!(dts[0].tags.is_empty());
    }

    #[test]
    fn test_tags_are_deduplicated_and_trimmed() {
        let doc = "neplg2:test[ should_panic, skip ,should_panic]\n```neplg2\nx\n```\n";
        let dts = md(doc);
        assert_eq!(dts.len(), 1);
        let tags: Vec<_> = dts[0].tags.iter().cloned().collect();
        assert_eq!(tags, vec!["should_panic".to_string(), "skip".to_string()]);
    }

    #[test]
    fn test_marker_without_fence_is_dropped() {
        let doc = "neplg2:test\nno fence here\n";
        assert!(md(doc).is_empty());
    }

    #[test]
    fn test_unclosed_fence_is_dropped() {
        let doc = "neplg2:test\n```neplg2\nprint 1\n";
        assert!(md(doc).is_empty());
    }

    #[test]
    fn test_incidental_fence_without_marker_is_ignored() {
        let doc = "```neplg2\nnot a doctest\n```\n";
        assert!(md(doc).is_empty());
    }

    #[test]
    fn test_hidden_prefix_is_stripped_but_compiled() {
        let doc = "neplg2:test\n```neplg2\n| import std\nprint 1\n```\n";
        let dts = md(doc);
        assert_eq!(dts[0].code, "import std\nprint 1\n");
        assert_eq!(dts[0].hidden, vec![true, false]);
    }

    #[test]
    fn test_metadata_lines_between_marker_and_fence() {
        let doc = "neplg2:test\nstdin: '3\\n4\\n'\nstdout: \"7\\n\"\n```neplg2\nsum\n```\n";
        let dts = md(doc);
        assert_eq!(dts[0].stdin.as_deref(), Some("3\n4\n"));
        assert_eq!(dts[0].stdout.as_deref(), Some("7\n"));
        assert_eq!(dts[0].stderr, None);
    }

    #[test]
    fn test_bare_metadata_value() {
        let doc = "neplg2:test\nstderr: boom\n```neplg2\nx\n```\n";
        assert_eq!(md(doc)[0].stderr.as_deref(), Some("boom"));
    }

    #[test]
    fn test_malformed_metadata_value_is_ignored() {
        let doc = "neplg2:test\nstdin: 'unterminated\n```neplg2\nx\n```\n";
        assert_eq!(md(doc)[0].stdin, None);
    }

    #[test]
    fn test_multiple_doctests_in_order() {
        let doc = "neplg2:test\n```neplg2\na\n```\ntext\nneplg2:test[skip]\n```neplg2\nb\n```\n";
        let dts = md(doc);
        assert_eq!(dts.len(), 2);
        assert_eq!(dts[0].code, "a\n");
        assert_eq!(dts[1].code, "b\n");
        assert!(dts[1].tags.contains("skip"));
    }

    #[test]
    fn test_crlf_documents() {
        let doc = "neplg2:test\r\n```neplg2\r\nprint 1\r\n```\r\n";
        let dts = md(doc);
        assert_eq!(dts.len(), 1);
        assert_eq!(dts[0].code, "print 1\n");
    }

    #[test]
    fn test_source_dialect_doc_comments() {
        let doc = "\
fn real_code() {}
//: neplg2:test
//: ```neplg2
//:| hidden line
//: print 2
//: ```
";
        let dts = extract_text(doc, Dialect::Source);
        assert_eq!(dts.len(), 1);
        assert_eq!(dts[0].code, "hidden line\nprint 2\n");
        assert_eq!(dts[0].hidden, vec![true, false]);
    }

    #[test]
    fn test_source_dialect_ignores_plain_comments() {
        let doc = "// neplg2:test\n// ```neplg2\n// x\n// ```\n";
        assert!(extract_text(doc, Dialect::Source).is_empty());
    }

    #[test]
    fn test_source_dialect_non_doc_line_does_not_close_fence() {
        // An interleaved code line transforms to "" and must not terminate
        // the fence scan.
        let doc = "//: neplg2:test\n//: ```neplg2\n//: a\nlet x = 1;\n//: b\n//: ```\n";
        let dts = extract_text(doc, Dialect::Source);
        assert_eq!(dts.len(), 1);
        assert_eq!(dts[0].code, "a\n\nb\n");
    }

    #[test]
    fn test_dialect_selection() {
        assert_eq!(
            Dialect::for_path(Path::new("doc/intro.n.md")),
            Some(Dialect::Markdown)
        );
        assert_eq!(
            Dialect::for_path(Path::new("stdlib/core.nepl")),
            Some(Dialect::Source)
        );
        assert_eq!(Dialect::for_path(Path::new("README.md")), None);
    }

    #[test]
    fn test_collect_cases_assigns_ids_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("skipme")).unwrap();
        std::fs::write(
            root.join("a.n.md"),
            "neplg2:test\n```neplg2\none\n```\nneplg2:test\n```neplg2\ntwo\n```\n",
        )
        .unwrap();
        std::fs::write(
            root.join("skipme").join("b.n.md"),
            "neplg2:test\n```neplg2\nnope\n```\n",
        )
        .unwrap();
        std::fs::write(root.join("notes.txt"), "neplg2:test ignored").unwrap();

        let cases =
            collect_cases(&[root.to_path_buf()], &["skipme".to_string()]).unwrap();
        assert_eq!(cases.len(), 2);
        assert!(cases[0].id.ends_with("a.n.md::doctest#1"));
        assert!(cases[1].id.ends_with("a.n.md::doctest#2"));
        assert_eq!(cases[1].index, 2);
        assert_eq!(cases[1].source, "two\n");
    }
}
