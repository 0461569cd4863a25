//! End-to-end CLI checks that do not need a compiler service on disk.

use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    Command::cargo_bin("nepl-doctest").unwrap()
}

#[test]
fn run_without_required_args_is_a_usage_error() {
    cli()
        .arg("run")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--input"));
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    cli().arg("frobnicate").assert().failure().code(2);
}

#[test]
fn run_over_empty_tree_writes_an_empty_report() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("docs");
    std::fs::create_dir(&input).unwrap();
    let report = dir.path().join("out").join("report.json");

    cli()
        .arg("run")
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&report)
        .assert()
        .success()
        .stdout(predicate::str::contains("0 total"));

    let text = std::fs::read_to_string(&report).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["schema"], "neplg2-doctest/v1");
    assert_eq!(json["summary"]["total"], 0);
    assert_eq!(json["results"].as_array().unwrap().len(), 0);
}

#[test]
fn analyze_buckets_a_report() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    let report = serde_json::json!({
        "schema": "neplg2-doctest/v1",
        "generated_at": "2026-01-01T00:00:00+00:00",
        "jobs": 2,
        "runner": "wasm",
        "flags": {
            "assert_io": false,
            "strict_pairs": false,
            "compile_only": false,
            "llvm_all": false
        },
        "summary": { "total": 3, "passed": 1, "failed": 2, "errored": 0 },
        "results": [
            {
                "id": "a.n.md::doctest#1",
                "file": "a.n.md",
                "index": 1,
                "status": "pass",
                "phase": "run",
                "ok": true,
                "duration_ms": 1,
                "worker": 0
            },
            {
                "id": "a.n.md::doctest#2",
                "file": "a.n.md",
                "index": 2,
                "status": "fail",
                "phase": "compile",
                "ok": false,
                "error": "parse error: expected Indent, found Newline",
                "duration_ms": 1,
                "worker": 0
            },
            {
                "id": "a.n.md::doctest#3",
                "file": "a.n.md",
                "index": 3,
                "status": "fail",
                "phase": "compile",
                "ok": false,
                "error": "expected Indent, found Dedent",
                "duration_ms": 1,
                "worker": 1
            }
        ]
    });
    std::fs::write(&path, serde_json::to_string_pretty(&report).unwrap()).unwrap();

    let output = cli()
        .arg("analyze")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let analysis: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(analysis["by_status"]["fail"], 2);
    assert_eq!(
        analysis["fail_error_reasons"][0]["reason"],
        "indent_expected"
    );
    assert_eq!(analysis["fail_error_reasons"][0]["count"], 2);
}

#[test]
fn analyze_missing_report_fails() {
    cli()
        .arg("analyze")
        .arg("/nonexistent/report.json")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read report"));
}
