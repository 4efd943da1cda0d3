use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::evaluation::HttpEvaluator;
use crate::model::Suite;
use crate::runner::{progress, ParallelRunner, ProgressEvent, RunError, RunOptions};
use crate::storage::{ResultStore, StoreError};

/// Capacity of the per-run broadcast feeding SSE subscribers.
const EVENT_FANOUT: usize = 256;

/// A run started through the API that has not finished yet.
#[derive(Clone)]
pub struct ActiveRun {
    pub suite_name: String,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub events: broadcast::Sender<ProgressEvent>,
}

#[derive(Clone)]
pub struct AppState {
    pub runner: ParallelRunner,
    /// Scoring service client, for metric listing and health.
    pub evaluator: Option<HttpEvaluator>,
    pub config: Arc<AppConfig>,
    pub active: Arc<RwLock<HashMap<String, ActiveRun>>>,
    /// Background run tasks, awaited on shutdown so final records get written.
    tasks: TaskTracker,
}

impl AppState {
    pub fn new(runner: ParallelRunner, evaluator: Option<HttpEvaluator>, config: AppConfig) -> Self {
        Self {
            runner,
            evaluator,
            config: Arc::new(config),
            active: Arc::new(RwLock::new(HashMap::new())),
            tasks: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn ResultStore> {
        self.runner.store().clone()
    }

    /// Run a store query off the async runtime.
    pub async fn query<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ResultStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store();
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Start `suite` in the background and track it until it finishes.
    pub async fn start_run(&self, suite: Suite, mut options: RunOptions) -> Result<String, RunError> {
        let (sink, mut rx) = progress::channel(self.config.runner.progress_buffer);
        options.progress = Some(sink);
        let suite_name = suite.name.clone();
        let handle = self.runner.spawn(Arc::new(suite), options)?;
        let run_id = handle.run_id().to_string();

        let (events, _) = broadcast::channel(EVENT_FANOUT);
        self.active.write().await.insert(
            run_id.clone(),
            ActiveRun {
                suite_name,
                started_at: Utc::now(),
                cancel: handle.cancel_token(),
                events: events.clone(),
            },
        );

        let active = self.active.clone();
        let id = run_id.clone();
        self.tasks.spawn(async move {
            while let Some(event) = rx.recv().await {
                // No subscribers is fine.
                let _ = events.send(event);
            }
            match handle.wait().await {
                Ok(outcome) => info!(run_id = %id, status = %outcome.run.status, "background run finished"),
                Err(e) => error!(run_id = %id, error = %e, "background run failed"),
            }
            active.write().await.remove(&id);
        });

        Ok(run_id)
    }

    /// Cancel every active run and wait up to `grace` for each to record its
    /// final state. Returns false if some run was still going at the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let active: Vec<String> = {
            let runs = self.active.read().await;
            for run in runs.values() {
                run.cancel.cancel();
            }
            runs.keys().cloned().collect()
        };
        if !active.is_empty() {
            info!(runs = active.len(), "cancelled active runs, waiting for them to finish");
        }
        self.tasks.close();
        match tokio::time::timeout(grace, self.tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "active runs did not finish before shutdown deadline");
                false
            }
        }
    }
}
