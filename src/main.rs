//! nepl-doctest CLI - extract and run nepl doctests.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use nepl_doctest::compare::{CompareOptions, compare_results};
use nepl_doctest::exec::{CaseResult, ExecOptions};
use nepl_doctest::extract::{TestCase, collect_cases};
use nepl_doctest::pool::{ResultCallback, WorkerPool, default_jobs};
use nepl_doctest::report::{Report, RunFlags, read_report};
use nepl_doctest::analyze;
use nepl_doctest::backend::llvm::LlvmBackend;
use nepl_doctest::backend::wasm::WasmBackend;

/// Caps the reference-backend worker count; native compiles are far heavier
/// than the in-process service.
const LLVM_JOBS_ENV: &str = "NEPL_LLVM_JOBS";

/// Directories never scanned for doctests.
const DEFAULT_EXCLUDES: &[&str] = &["node_modules", "target", ".git", "dist"];

#[derive(Parser)]
#[command(name = "nepl-doctest")]
#[command(about = "Extract and run nepl doctests", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract doctests, run them, and write a JSON report
    Run {
        /// Files or directories to scan (repeatable)
        #[arg(short, long = "input", required = true)]
        inputs: Vec<PathBuf>,

        /// Report output path
        #[arg(short, long)]
        output: PathBuf,

        /// Hint for locating the packaged compiler service
        #[arg(long)]
        dist: Option<PathBuf>,

        /// Worker count (default: half the CPUs, at most 8)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Backend selection
        #[arg(long, value_enum, default_value_t = Runner::Wasm)]
        runner: Runner,

        /// With --runner all, run every case through the reference backend
        /// instead of only those tagged `llvm`
        #[arg(long)]
        llvm_all: bool,

        /// Assert declared stdin/stdout expectations for every case
        #[arg(long, env = "NEPL_DOCTEST_ASSERT_IO")]
        assert_io: bool,

        /// Treat a case executed by only one backend as a comparison failure
        #[arg(long)]
        strict_pairs: bool,

        /// Stop after compiling; never run artifacts
        #[arg(long)]
        compile_only: bool,

        /// Directory name to skip while scanning (repeatable)
        #[arg(long = "exclude-dir")]
        exclude_dirs: Vec<String>,

        /// Skip `stdlib` directories
        #[arg(long)]
        skip_stdlib: bool,

        /// Skip `analysis` directories
        #[arg(long)]
        skip_analysis: bool,
    },

    /// Bucket a report's failures by diagnostic shape
    Analyze {
        /// Report to analyze
        report: PathBuf,

        /// Keep only the most common reason buckets
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Runner {
    /// In-process compiler service + WASI sandbox
    Wasm,
    /// External reference compiler + native toolchain
    Llvm,
    /// Both, with behavior comparison
    All,
}

impl std::fmt::Display for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Runner::Wasm => write!(f, "wasm"),
            Runner::Llvm => write!(f, "llvm"),
            Runner::All => write!(f, "all"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            inputs,
            output,
            dist,
            jobs,
            runner,
            llvm_all,
            assert_io,
            strict_pairs,
            compile_only,
            exclude_dirs,
            skip_stdlib,
            skip_analysis,
        } => {
            run_doctests(RunArgs {
                inputs,
                output,
                dist,
                jobs: jobs.unwrap_or_else(default_jobs),
                runner,
                llvm_all,
                assert_io,
                strict_pairs,
                compile_only,
                exclude_dirs,
                skip_stdlib,
                skip_analysis,
            })
            .await
        }
        Commands::Analyze { report, top } => analyze_report(&report, top),
    }
}

struct RunArgs {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    dist: Option<PathBuf>,
    jobs: usize,
    runner: Runner,
    llvm_all: bool,
    assert_io: bool,
    strict_pairs: bool,
    compile_only: bool,
    exclude_dirs: Vec<String>,
    skip_stdlib: bool,
    skip_analysis: bool,
}

async fn run_doctests(args: RunArgs) -> Result<()> {
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(args.exclude_dirs.iter().cloned());
    if args.skip_stdlib {
        excludes.push("stdlib".to_string());
    }
    if args.skip_analysis {
        excludes.push("analysis".to_string());
    }

    let cases = collect_cases(&args.inputs, &excludes).context("failed to collect doctests")?;
    info!("collected {} doctests", cases.len());
    if cases.is_empty() {
        warn!("no doctests found under the given inputs");
    }

    // The reference backend only sees cases opted in via the `llvm` tag
    // unless --llvm-all widens it.
    let llvm_cases: Vec<TestCase> = match args.runner {
        Runner::Wasm => Vec::new(),
        Runner::Llvm | Runner::All if args.llvm_all => cases.clone(),
        Runner::Llvm | Runner::All => {
            cases.iter().filter(|c| c.has_tag("llvm")).cloned().collect()
        }
    };

    let scheduled = match args.runner {
        Runner::Wasm => cases.len(),
        Runner::Llvm => llvm_cases.len(),
        Runner::All => cases.len() + llvm_cases.len(),
    };
    let bar = progress_bar(scheduled as u64);
    let on_result: ResultCallback = {
        let bar = bar.clone();
        Arc::new(move |r: &CaseResult| {
            bar.set_message(r.id.clone());
            bar.inc(1);
        })
    };

    let opts = ExecOptions {
        assert_io: args.assert_io,
        compile_only: args.compile_only,
        id_suffix: None,
    };

    let mut results: Vec<CaseResult> = Vec::new();

    if args.runner != Runner::Llvm {
        let dist = args.dist.clone();
        let pool = WorkerPool::new(args.jobs).with_callback(Arc::clone(&on_result));
        let wasm = pool
            .run(&cases, &opts, |_| WasmBackend::new(dist.as_deref()))
            .await;
        results.extend(wasm);
    }

    if !llvm_cases.is_empty() {
        let llvm_opts = ExecOptions {
            // Standalone llvm runs keep plain ids; only the dual run needs
            // the suffix to keep both record sets apart.
            id_suffix: (args.runner == Runner::All).then(|| "::llvm".to_string()),
            ..opts.clone()
        };
        let pool = WorkerPool::new(llvm_jobs(args.jobs)).with_callback(Arc::clone(&on_result));
        let llvm = pool
            .run(&llvm_cases, &llvm_opts, |_| Ok(LlvmBackend::from_env()))
            .await;
        results.extend(llvm);
    }

    bar.finish_and_clear();

    if args.runner == Runner::All {
        let diffs = compare_results(
            &results,
            CompareOptions {
                strict_pairs: args.strict_pairs,
            },
        );
        info!("comparison found {} divergences", diffs.len());
        results.extend(diffs);
    }

    let report = Report::new(
        results,
        args.jobs,
        args.runner.to_string(),
        RunFlags {
            assert_io: args.assert_io,
            strict_pairs: args.strict_pairs,
            compile_only: args.compile_only,
            llvm_all: args.llvm_all,
        },
        args.dist,
    );
    report
        .write(&args.output)
        .with_context(|| format!("failed to write report to {}", args.output.display()))?;
    report.print_summary();

    std::process::exit(report.summary.exit_code());
}

fn analyze_report(path: &PathBuf, top: usize) -> Result<()> {
    let report = read_report(path)
        .with_context(|| format!("failed to read report from {}", path.display()))?;
    let analysis = analyze::analyze(&report, path.display().to_string(), top);
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

/// Reference-backend worker count: the run's `--jobs`, lowered by the
/// `NEPL_LLVM_JOBS` ceiling when set.
fn llvm_jobs(jobs: usize) -> usize {
    match std::env::var(LLVM_JOBS_ENV).ok().and_then(|v| v.parse().ok()) {
        Some(ceiling) => jobs.min(ceiling).max(1),
        None => jobs,
    }
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}
