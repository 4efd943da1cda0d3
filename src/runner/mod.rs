//! Parallel runner: executes a suite with bounded concurrency.
//!
//! Executors run as tasks on a `JoinSet`, gated by a semaphore. Each finished
//! result travels over a channel to a single aggregator task, which is the
//! only writer of the run counters and the only caller of `save_result`.
//! Progress is emitted by the aggregator after the result is recorded.

pub mod executor;
pub mod progress;

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::AdapterRegistry;
use crate::model::{ErrorKind, RunStatus, Suite, TestResult, TestRun};
use crate::storage::{ResultStore, StoreError};

pub use self::executor::{ExecutionContext, TestExecutor};
pub use self::progress::{ProgressEvent, ProgressSink};

/// Faults that stop a run before any test executes.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("suite '{0}' has no test cases")]
    EmptySuite(String),

    #[error("suite '{suite}' has no runnable adapter: {reason}")]
    NoUsableAdapter { suite: String, reason: String },

    #[error("max_concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("run aggregator failed: {0}")]
    Aborted(String),
}

/// Caller-controlled knobs for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Generated when absent.
    pub run_id: Option<String>,
    /// When set, only these test-case ids execute; the rest are skipped.
    pub only: Option<BTreeSet<String>>,
    /// Extra substitution variables for every case.
    pub variables: Map<String, Value>,
    /// Overrides the configured concurrency cap.
    pub max_concurrency: Option<usize>,
    pub progress: Option<ProgressSink>,
    pub cancel: CancellationToken,
}

/// Final run record plus one result per suite case, in suite order.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: TestRun,
    pub results: Vec<TestResult>,
}

/// A run executing in the background.
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    join: JoinHandle<Result<RunOutcome, RunError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stop admitting new tests. Already-running tests follow the runner's
    /// `interrupt_in_flight` setting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<RunOutcome, RunError> {
        self.join
            .await
            .map_err(|e| RunError::Aborted(e.to_string()))?
    }
}

#[derive(Clone)]
pub struct ParallelRunner {
    executor: TestExecutor,
    store: Arc<dyn ResultStore>,
}

impl ParallelRunner {
    pub fn new(executor: TestExecutor, store: Arc<dyn ResultStore>) -> Self {
        Self { executor, store }
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn registry(&self) -> &AdapterRegistry {
        self.executor.registry()
    }

    /// Reject suites that cannot run at all.
    ///
    /// A case with an unregistered adapter is only fatal when no case in the
    /// suite resolves to a registered one; otherwise it errors on its own.
    pub fn validate(&self, suite: &Suite) -> Result<(), RunError> {
        if suite.cases.is_empty() {
            return Err(RunError::EmptySuite(suite.name.clone()));
        }
        let registry = self.executor.registry();
        let runnable = suite.cases.iter().any(|case| {
            suite
                .effective_adapter(case)
                .is_some_and(|spec| registry.contains(&spec.kind))
        });
        if runnable {
            return Ok(());
        }
        let reason = match &suite.default_adapter {
            None => "no default adapter and no per-test override".to_string(),
            Some(spec) => format!(
                "default adapter type '{}' is not registered (available: {})",
                spec.kind,
                registry.kinds().join(", ")
            ),
        };
        Err(RunError::NoUsableAdapter {
            suite: suite.name.clone(),
            reason,
        })
    }

    /// Validate, then run the suite on a background task.
    pub fn spawn(&self, suite: Arc<Suite>, mut options: RunOptions) -> Result<RunHandle, RunError> {
        self.validate(&suite)?;
        let run_id = options
            .run_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let cancel = options.cancel.clone();
        let runner = self.clone();
        let join = tokio::spawn(async move { runner.run(suite, options).await });
        Ok(RunHandle {
            run_id,
            cancel,
            join,
        })
    }

    /// Execute every case of `suite` and wait for the outcome.
    pub async fn run(&self, suite: Arc<Suite>, options: RunOptions) -> Result<RunOutcome, RunError> {
        self.validate(&suite)?;
        let cap = options
            .max_concurrency
            .unwrap_or(self.executor.config().max_concurrency);
        if cap == 0 {
            return Err(RunError::InvalidConcurrency);
        }

        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut run = TestRun::new(&run_id, &suite.name, suite.cases.len());
        run.metadata.insert("suite_version".into(), suite.version.clone().into());
        run.metadata.insert("max_concurrency".into(), cap.into());
        if let Some(only) = &options.only {
            run.metadata.insert("test_filter".into(), only.iter().cloned().collect::<Vec<_>>().into());
            for id in only.iter().filter(|id| !suite.cases.iter().any(|c| &c.id == *id)) {
                warn!(run_id = %run_id, test_case_id = %id, "filtered test id not in suite");
            }
        }

        if let Err(e) = persist_run(&self.store, &run).await {
            warn!(run_id = %run_id, error = %e, "failed to persist run start");
            run.persistence_degraded = true;
        }
        info!(run_id = %run_id, suite = %suite.name, total = run.total, max_concurrency = cap, "run started");

        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = tokio::spawn(aggregate(
            run,
            rx,
            self.store.clone(),
            options.progress.clone(),
        ));

        let ctx = ExecutionContext {
            run_id: run_id.clone(),
            variables: Arc::new(options.variables.clone()),
            cancel: options.cancel.clone(),
        };
        let semaphore = Arc::new(Semaphore::new(cap));
        let mut tasks = JoinSet::new();
        let mut cut_short = false;

        for (idx, case) in suite.cases.iter().enumerate() {
            if !case.enabled {
                let reason = case.skip_reason.clone().unwrap_or_else(|| "test disabled".into());
                let _ = tx.send((idx, TestResult::skipped(&case.id, reason)));
                continue;
            }
            if options.only.as_ref().is_some_and(|only| !only.contains(&case.id)) {
                let _ = tx.send((idx, TestResult::skipped(&case.id, "excluded by run filter")));
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                cut_short = true;
                let _ = tx.send((idx, TestResult::skipped(&case.id, "run cancelled")));
                continue;
            };

            let executor = self.executor.clone();
            let suite = suite.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let case = &suite.cases[idx];
                let result = AssertUnwindSafe(executor.execute(&suite, case, &ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        error!(run_id = %ctx.run_id, test_case_id = %case.id, "executor panicked");
                        TestResult::errored(
                            &case.id,
                            ErrorKind::Internal,
                            format!("executor panicked: {}", panic_message(panic.as_ref())),
                        )
                    });
                let _ = tx.send((idx, result));
            });
        }
        drop(tx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(run_id = %run_id, error = %e, "executor task failed");
            }
        }

        let (mut run, results) = aggregator
            .await
            .map_err(|e| RunError::Aborted(e.to_string()))?;

        let mut final_results = Vec::with_capacity(results.len());
        for (idx, slot) in results.into_iter().enumerate() {
            match slot {
                Some(result) => final_results.push(result),
                None => {
                    // Only reachable when a task died without reporting.
                    let result = TestResult::errored(
                        &suite.cases[idx].id,
                        ErrorKind::Internal,
                        "executor task ended without a result",
                    );
                    run.record(result.status);
                    if persist_result(&self.store, &run.id, &result).await.is_err() {
                        run.persistence_degraded = true;
                    }
                    final_results.push(result);
                }
            }
        }

        // A cancel that arrives after the last case was admitted changes nothing.
        let interrupted = final_results
            .iter()
            .any(|r| r.error_kind == Some(ErrorKind::Cancelled));
        let status = if cut_short || interrupted {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        run.finish(status);
        if let Some(sink) = &options.progress {
            if sink.dropped() > 0 {
                run.metadata.insert("progress_events_dropped".into(), sink.dropped().into());
            }
        }
        if let Err(e) = persist_run(&self.store, &run).await {
            warn!(run_id = %run.id, error = %e, "failed to persist final run record");
            run.persistence_degraded = true;
        }

        let summary = run.summary();
        info!(
            run_id = %run.id,
            status = %run.status,
            passed = run.passed,
            failed = run.failed,
            errored = run.errored,
            skipped = run.skipped,
            persistence_degraded = run.persistence_degraded,
            "run finished"
        );
        if let Some(sink) = &options.progress {
            sink.emit(ProgressEvent::RunCompleted {
                run_id: run.id.clone(),
                summary,
            });
        }

        Ok(RunOutcome {
            run,
            results: final_results,
        })
    }
}

/// Single writer for the run: counts, persists and announces every result.
async fn aggregate(
    mut run: TestRun,
    mut rx: mpsc::UnboundedReceiver<(usize, TestResult)>,
    store: Arc<dyn ResultStore>,
    progress: Option<ProgressSink>,
) -> (TestRun, Vec<Option<TestResult>>) {
    let mut slots: Vec<Option<TestResult>> = vec![None; run.total];

    while let Some((idx, result)) = rx.recv().await {
        if slots[idx].is_some() {
            error!(run_id = %run.id, test_case_id = %result.test_case_id, "duplicate result ignored");
            continue;
        }
        if let Err(e) = persist_result(&store, &run.id, &result).await {
            warn!(
                run_id = %run.id,
                test_case_id = %result.test_case_id,
                error = %e,
                "failed to persist result, keeping it in memory"
            );
            run.persistence_degraded = true;
        }
        run.record(result.status);
        if let Some(sink) = &progress {
            sink.emit(ProgressEvent::TestCompleted {
                run_id: run.id.clone(),
                test_case_id: result.test_case_id.clone(),
                result: result.clone(),
            });
        }
        slots[idx] = Some(result);
    }

    (run, slots)
}

async fn persist_run(store: &Arc<dyn ResultStore>, run: &TestRun) -> Result<(), StoreError> {
    let store = store.clone();
    let run = run.clone();
    tokio::task::spawn_blocking(move || store.save_run(&run))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

async fn persist_result(
    store: &Arc<dyn ResultStore>,
    run_id: &str,
    result: &TestResult,
) -> Result<(), StoreError> {
    let store = store.clone();
    let run_id = run_id.to_string();
    let result = result.clone();
    tokio::task::spawn_blocking(move || store.save_result(&run_id, &result))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
