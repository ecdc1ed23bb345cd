//! Batch orchestration.
//!
//! A batch is the cross product of clauses and methods. Every (clause,
//! method) task runs independently on a bounded rayon pool:
//!
//! ```text
//! resolve method ──► cache get ──► backend (deadline) ──► cache put
//!      │ unknown          │ hit          │ error/timeout/panic
//!      ▼                  ▼              ▼
//!  UnsupportedMethod   Success        failure outcome
//! ```
//!
//! Completions travel over a channel to the calling thread, which is the
//! only place the report is mutated.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, DiskCache};
use crate::config::{CacheConfig, RetrievalConfig};
use crate::corpus::{Corpus, dedupe_clauses};
use crate::dispatch::{RetrievalDispatcher, checked_invoke};
use crate::model::types::{Clause, RecordId, RetrievalTask, TaskCompletion, TaskOutcome};
use crate::report::{AggregatedReport, ResultAggregator};
use crate::timeout::{TimeoutError, TimeoutExecutor, panic_message};

/// Default per-task deadline.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("k must be at least 1, got {0}")]
    InvalidK(usize),

    #[error("at least one retrieval method is required")]
    NoMethods,

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Per-batch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub unsupported: usize,
    pub cache_hits: usize,
    pub elapsed_ms: u128,
}

impl BatchSummary {
    fn record(&mut self, completion: &TaskCompletion) {
        match completion.outcome {
            TaskOutcome::Success(_) => self.succeeded += 1,
            TaskOutcome::BackendFailure(_) => self.failed += 1,
            TaskOutcome::Timeout(_) => self.timed_out += 1,
            TaskOutcome::UnsupportedMethod => self.unsupported += 1,
        }
        if completion.cached {
            self.cache_hits += 1;
        }
    }
}

/// The report of a finished batch plus its counters.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub report: AggregatedReport,
    pub summary: BatchSummary,
}

/// Runs batches of retrieval tasks.
pub struct BatchOrchestrator {
    dispatcher: RetrievalDispatcher,
    executor: TimeoutExecutor,
    task_timeout: Duration,
    workers: usize,
    cache: Option<(PathBuf, CacheConfig)>,
    caches: Mutex<HashMap<String, Arc<DiskCache>>>,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("dispatcher", &self.dispatcher)
            .field("task_timeout", &self.task_timeout)
            .field("workers", &self.workers)
            .field("cache", &self.cache.as_ref().map(|(root, _)| root))
            .finish()
    }
}

impl BatchOrchestrator {
    /// An orchestrator with no cache, the default deadline, and one worker per core.
    pub fn new(dispatcher: RetrievalDispatcher) -> Self {
        Self {
            dispatcher,
            executor: TimeoutExecutor::default(),
            task_timeout: DEFAULT_TASK_TIMEOUT,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            cache: None,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch table, cache, deadline and pool size taken from configuration.
    pub fn from_config(config: &RetrievalConfig) -> Self {
        let orchestrator = Self::new(RetrievalDispatcher::from_config(config))
            .with_timeout(config.task_timeout())
            .with_workers(config.worker_count());
        if config.cache.enabled {
            orchestrator.with_cache(config.cache_dir(), config.cache.clone())
        } else {
            orchestrator
        }
    }

    pub fn with_cache(mut self, root: PathBuf, config: CacheConfig) -> Self {
        self.cache = Some((root, config));
        self.caches.lock().clear();
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self.caches.lock().clear();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn dispatcher(&self) -> &RetrievalDispatcher {
        &self.dispatcher
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    /// The cache store for a corpus, shared by every batch this orchestrator runs on it.
    pub fn cache_for(&self, corpus: &Corpus) -> Option<Arc<DiskCache>> {
        let (root, config) = self.cache.as_ref()?;
        let mut caches = self.caches.lock();
        let cache = caches
            .entry(corpus.digest().to_string())
            .or_insert_with(|| Arc::new(DiskCache::for_corpus(root, corpus, config)));
        Some(Arc::clone(cache))
    }

    /// Run `clauses x methods` against `corpus`.
    pub fn run(
        &self,
        clauses: &[Clause],
        methods: &[String],
        k: usize,
        corpus: Arc<Corpus>,
    ) -> Result<BatchReport, OrchestratorError> {
        self.run_with_progress(clauses, methods, k, corpus, |_, _| {})
    }

    /// Like [`run`](Self::run), calling `on_progress(done, total)` on the
    /// calling thread after each completion is folded.
    pub fn run_with_progress<F>(
        &self,
        clauses: &[Clause],
        methods: &[String],
        k: usize,
        corpus: Arc<Corpus>,
        mut on_progress: F,
    ) -> Result<BatchReport, OrchestratorError>
    where
        F: FnMut(usize, usize),
    {
        if k == 0 {
            return Err(OrchestratorError::InvalidK(k));
        }
        let methods = dedupe_methods(methods);
        if methods.is_empty() {
            return Err(OrchestratorError::NoMethods);
        }
        let clauses = dedupe_clauses(clauses.to_vec());

        let tasks: Vec<RetrievalTask> = clauses
            .iter()
            .flat_map(|clause| {
                methods.iter().map(move |method| RetrievalTask {
                    clause_id: clause.id.clone(),
                    clause_text: clause.text.clone(),
                    method: method.clone(),
                    k,
                })
            })
            .collect();
        let total = tasks.len();
        let mut aggregator = ResultAggregator::expecting(
            clauses.iter().map(|c| c.id.clone()),
            methods.iter().cloned(),
        );
        let mut summary = BatchSummary {
            tasks: total,
            ..BatchSummary::default()
        };

        info!(
            clauses = clauses.len(),
            methods = methods.len(),
            tasks = total,
            workers = self.workers,
            documents = corpus.len(),
            timeout_secs = self.task_timeout.as_secs_f64(),
            "Starting batch"
        );
        let started = Instant::now();

        if total > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.workers.min(total))
                .thread_name(|i| format!("clauseret-worker-{i}"))
                .build()?;
            let cache = self.cache_for(&corpus);
            let (tx, rx) = crossbeam_channel::unbounded::<TaskCompletion>();

            pool.in_place_scope(|scope| {
                for task in tasks {
                    let tx = tx.clone();
                    let corpus = Arc::clone(&corpus);
                    let cache = cache.clone();
                    scope.spawn(move |_| {
                        let completion = self.execute(task, &corpus, cache.as_deref());
                        let _ = tx.send(completion);
                    });
                }
                drop(tx);

                let mut done = 0;
                for completion in rx.iter() {
                    done += 1;
                    summary.record(&completion);
                    aggregator.fold(
                        completion.task.clause_id,
                        &completion.task.method,
                        completion.outcome,
                    );
                    on_progress(done, total);
                }
            });
        }

        summary.elapsed_ms = started.elapsed().as_millis();
        let report = aggregator.finalize();
        info!(
            tasks = summary.tasks,
            succeeded = summary.succeeded,
            failed = summary.failed,
            timed_out = summary.timed_out,
            unsupported = summary.unsupported,
            cache_hits = summary.cache_hits,
            elapsed_ms = summary.elapsed_ms as u64,
            "Batch complete"
        );
        Ok(BatchReport { report, summary })
    }

    /// One query through the same resolve, cache and deadline pipeline.
    pub fn run_single(
        &self,
        query: &str,
        method: &str,
        k: usize,
        corpus: &Arc<Corpus>,
    ) -> Result<TaskCompletion, OrchestratorError> {
        if k == 0 {
            return Err(OrchestratorError::InvalidK(k));
        }
        let task = RetrievalTask {
            clause_id: RecordId::Int(0),
            clause_text: query.to_string(),
            method: method.to_string(),
            k,
        };
        let cache = self.cache_for(corpus);
        Ok(self.execute(task, corpus, cache.as_deref()))
    }

    /// Run one task to completion. Never panics and never returns early.
    fn execute(
        &self,
        task: RetrievalTask,
        corpus: &Arc<Corpus>,
        cache: Option<&DiskCache>,
    ) -> TaskCompletion {
        let started = Instant::now();
        let (outcome, cached) =
            catch_unwind(AssertUnwindSafe(|| self.process(&task, corpus, cache))).unwrap_or_else(
                |payload| {
                    let reason = format!("task panicked: {}", panic_message(payload));
                    (TaskOutcome::BackendFailure(reason), false)
                },
            );
        let elapsed = started.elapsed();

        match outcome.failure_reason() {
            None => debug!(
                clause = %task.clause_id,
                method = %task.method,
                cached,
                elapsed_ms = elapsed.as_millis() as u64,
                "task succeeded"
            ),
            Some(reason) => warn!(
                clause = %task.clause_id,
                method = %task.method,
                outcome = outcome.kind(),
                %reason,
                elapsed_ms = elapsed.as_millis() as u64,
                "task failed"
            ),
        }

        TaskCompletion {
            task,
            outcome,
            cached,
            elapsed,
        }
    }

    fn process(
        &self,
        task: &RetrievalTask,
        corpus: &Arc<Corpus>,
        cache: Option<&DiskCache>,
    ) -> (TaskOutcome, bool) {
        let Ok((method, backend)) = self.dispatcher.resolve(&task.method) else {
            return (TaskOutcome::UnsupportedMethod, false);
        };

        let key = CacheKey::new(&task.clause_text, method.id(), task.k);
        if let Some(cache) = cache
            && let Some(hit) = cache.get(&key)
        {
            return (TaskOutcome::Success(hit), true);
        }

        let corpus = Arc::clone(corpus);
        let query = task.clause_text.clone();
        let k = task.k;
        let result = self.executor.run(self.task_timeout, move || {
            checked_invoke(backend.as_ref(), &corpus, &query, k)
        });

        let outcome = match result {
            Ok(Ok(docs)) => {
                if let Some(cache) = cache {
                    cache.put(&key, &docs);
                }
                TaskOutcome::Success(docs)
            }
            Ok(Err(err)) => TaskOutcome::BackendFailure(err.to_string()),
            Err(TimeoutError::TimedOut { budget }) => TaskOutcome::Timeout(budget),
            Err(err) => TaskOutcome::BackendFailure(err.to_string()),
        };
        (outcome, false)
    }
}

/// Collapse repeated method strings, keeping first-seen order.
fn dedupe_methods(methods: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    methods
        .iter()
        .filter(|m| seen.insert(m.as_str()))
        .cloned()
        .collect()
}
