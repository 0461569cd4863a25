//! Worker pool: distributes the case list across concurrent workers.
//!
//! Each worker constructs its own backend exactly once and then repeatedly
//! claims the next unclaimed case index from a shared atomic counter until
//! the list is exhausted. Claiming order races; the report re-sorts results
//! deterministically afterwards, so nothing here depends on completion order.
//!
//! A worker whose backend fails to initialize keeps claiming and reports
//! `status=error` for every case it would have executed; losing a worker
//! must never shrink the reported case count.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::backend::{Backend, BackendResult};
use crate::exec::{CaseExecutor, CaseResult, ExecOptions, Phase, Status};
use crate::extract::TestCase;

/// Invoked for every finished case, e.g. to advance a progress bar.
pub type ResultCallback = Arc<dyn Fn(&CaseResult) + Send + Sync>;

/// Default worker count: half the available CPUs, clamped to 1..=8 so CI
/// runners with large machines do not oversubscribe the compiler service.
pub fn default_jobs() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus / 2).clamp(1, 8)
}

/// Fixed-size pool of case-executing workers.
pub struct WorkerPool {
    jobs: usize,
    on_result: Option<ResultCallback>,
}

impl WorkerPool {
    pub fn new(jobs: usize) -> Self {
        Self {
            jobs: jobs.max(1),
            on_result: None,
        }
    }

    /// Registers a per-result callback.
    pub fn with_callback(mut self, callback: ResultCallback) -> Self {
        self.on_result = Some(callback);
        self
    }

    /// Number of workers this pool will spawn.
    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Runs every case and returns one result per case, in claim order.
    ///
    /// `make_backend` is called once per worker with the worker id; backends
    /// are owned exclusively by their worker.
    pub async fn run<B, F>(
        &self,
        cases: &[TestCase],
        opts: &ExecOptions,
        make_backend: F,
    ) -> Vec<CaseResult>
    where
        B: Backend,
        F: Fn(usize) -> BackendResult<B> + Send + Sync,
    {
        let next = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(cases.len()));
        let make_backend = &make_backend;

        tokio_scoped::scope(|scope| {
            for worker in 0..self.jobs {
                let next = &next;
                let results = &results;
                let on_result = self.on_result.as_ref();

                scope.spawn(async move {
                    let mut backend = match make_backend(worker) {
                        Ok(b) => Ok(b),
                        Err(e) => {
                            error!("worker {worker}: backend init failed: {e}");
                            Err(e.to_string())
                        }
                    };

                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        if i >= cases.len() {
                            break;
                        }
                        let case = &cases[i];

                        let result = match &mut backend {
                            Ok(backend) => {
                                debug!("worker {worker}: running {}", case.id);
                                CaseExecutor::new(backend, opts, worker)
                                    .execute(case)
                                    .await
                            }
                            Err(diagnostic) => infra_error_result(case, diagnostic, worker, opts),
                        };

                        if let Some(cb) = on_result {
                            cb(&result);
                        }
                        results.lock().await.push(result);
                    }
                });
            }
        });

        results.into_inner()
    }
}

/// Result for a case whose worker never got a usable backend.
fn infra_error_result(
    case: &TestCase,
    diagnostic: &str,
    worker: usize,
    opts: &ExecOptions,
) -> CaseResult {
    let mut id = case.id.clone();
    if let Some(suffix) = &opts.id_suffix {
        id.push_str(suffix);
    }
    CaseResult {
        id,
        file: case.file.clone(),
        index: case.index,
        tags: case.tags.clone(),
        status: Status::Error,
        phase: Phase::Compile,
        ok: false,
        stdout: None,
        stderr: None,
        error: Some(diagnostic.to_string()),
        duration_ms: 0,
        worker,
        dist_dir: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::backend::mock::{MockBackend, Script};
    use std::collections::{BTreeSet, HashMap, HashSet};

    fn cases(n: usize) -> Vec<TestCase> {
        (0..n)
            .map(|i| TestCase {
                id: format!("doc.n.md::doctest#{}", i + 1),
                file: "doc.n.md".to_string(),
                index: i + 1,
                tags: BTreeSet::new(),
                source: "print 1\n".to_string(),
                stdin: String::new(),
                expected_stdout: None,
                expected_stderr: None,
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_case_gets_exactly_one_result() {
        let cases = cases(23);
        let pool = WorkerPool::new(4);
        let results = pool
            .run(&cases, &ExecOptions::default(), |_| {
                Ok(MockBackend::new(HashMap::new()))
            })
            .await;

        assert_eq!(results.len(), cases.len());
        let ids: HashSet<_> = results.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids.len(), cases.len(), "no case claimed twice or dropped");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_more_workers_than_cases() {
        let cases = cases(2);
        let pool = WorkerPool::new(8);
        let results = pool
            .run(&cases, &ExecOptions::default(), |_| {
                Ok(MockBackend::new(HashMap::new()))
            })
            .await;
        assert_eq!(results.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_backend_init_drains_as_errors() {
        let cases = cases(5);
        let pool = WorkerPool::new(1);
        let results = pool
            .run(&cases, &ExecOptions::default(), |_| {
                Err::<MockBackend, _>(BackendError::Init("dist not found".to_string()))
            })
            .await;

        assert_eq!(results.len(), 5);
        for r in &results {
            assert_eq!(r.status, Status::Error);
            assert!(r.error.as_deref().unwrap().contains("dist not found"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_broken_worker_does_not_drop_cases() {
        let cases = cases(17);
        let pool = WorkerPool::new(3);
        let results = pool
            .run(&cases, &ExecOptions::default(), |worker| {
                if worker == 1 {
                    Err(BackendError::Init("boom".to_string()))
                } else {
                    Ok(MockBackend::new(HashMap::new()))
                }
            })
            .await;

        assert_eq!(results.len(), cases.len());
        let ids: HashSet<_> = results.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids.len(), cases.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callback_sees_every_result() {
        let cases = cases(7);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        let pool = WorkerPool::new(2).with_callback(Arc::new(move |_| {
            seen_cb.fetch_add(1, Ordering::SeqCst);
        }));
        let results = pool
            .run(&cases, &ExecOptions::default(), |_| {
                Ok(MockBackend::new(HashMap::new()))
            })
            .await;
        assert_eq!(results.len(), 7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scripted_failures_flow_through() {
        let mut cases = cases(2);
        cases[1].tags.insert("should_panic".to_string());
        let pool = WorkerPool::new(2);
        let results = pool
            .run(&cases, &ExecOptions::default(), |_| {
                let mut scripts = HashMap::new();
                scripts.insert(
                    "doc.n.md::doctest#2".to_string(),
                    Script::Run {
                        stdout: "",
                        stderr: "",
                        trapped: true,
                    },
                );
                Ok(MockBackend::new(scripts))
            })
            .await;

        let panicking = results
            .iter()
            .find(|r| r.id.ends_with("#2"))
            .unwrap();
        assert_eq!(panicking.status, Status::Pass);
    }

    #[test]
    fn test_default_jobs_is_clamped() {
        let jobs = default_jobs();
        assert!((1..=8).contains(&jobs));
    }
}
