//! Executes one test case to completion: adapter, then evaluation.
//!
//! Every path out of [`TestExecutor::execute`] yields a fully populated
//! [`TestResult`]; per-test faults never propagate past this module.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::{
    self, Adapter, AdapterRegistry, AdapterResult, ConfigError, InvocationContext,
};
use crate::config::RunnerConfig;
use crate::evaluation::{Evaluation, EvaluationError, EvaluationRequest, Evaluator};
use crate::model::{ErrorKind, MetricScore, Suite, TestCase, TestResult, TestStatus};

/// Score assigned to a requested metric the evaluator did not return.
const MISSING_METRIC_REASON: &str = "metric missing from evaluation response";

/// Per-run information shared by every execution in the run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub run_id: String,
    /// Run-level substitution variables; override per-case ones.
    pub variables: Arc<Map<String, Value>>,
    pub cancel: CancellationToken,
}

/// Why a test stopped short of scoring.
struct Interrupted {
    kind: ErrorKind,
    message: String,
    actual_output: String,
    metadata: Map<String, Value>,
}

impl Interrupted {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            actual_output: String::new(),
            metadata: Map::new(),
        }
    }
}

impl From<ConfigError> for Interrupted {
    fn from(e: ConfigError) -> Self {
        Self::new(ErrorKind::Configuration, e.to_string())
    }
}

#[derive(Clone)]
pub struct TestExecutor {
    registry: Arc<AdapterRegistry>,
    evaluator: Arc<dyn Evaluator>,
    config: RunnerConfig,
}

impl TestExecutor {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        evaluator: Arc<dyn Evaluator>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            evaluator,
            config,
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `case` and produce its single result.
    pub async fn execute(&self, suite: &Suite, case: &TestCase, ctx: &ExecutionContext) -> TestResult {
        let adapter = match self.select_adapter(suite, case) {
            Ok(selected) => selected,
            Err(e) => return finish(case, ctx, Err(e.into()), Duration::ZERO),
        };

        let instance = adapter.0.clone();
        let start = Instant::now();
        let work = self.run_stages(case, adapter, ctx);
        let outcome = if self.config.interrupt_in_flight {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(Interrupted::new(
                    ErrorKind::Cancelled,
                    "run cancelled while the test was in flight",
                )),
                outcome = work => outcome,
            }
        } else {
            work.await
        };
        let elapsed = start.elapsed();
        self.teardown(case, instance.as_ref(), ctx).await;
        let result = finish(case, ctx, outcome, elapsed);
        debug!(
            run_id = %ctx.run_id,
            test_case_id = %case.id,
            status = %result.status,
            duration_ms = result.duration.as_millis() as u64,
            "test finished"
        );
        result
    }

    fn select_adapter(
        &self,
        suite: &Suite,
        case: &TestCase,
    ) -> Result<(Arc<dyn Adapter>, Map<String, Value>), ConfigError> {
        let spec = suite
            .effective_adapter(case)
            .ok_or_else(|| ConfigError::MissingAdapter {
                test_case_id: case.id.clone(),
            })?;
        let adapter = self.registry.create(&spec.kind)?;
        Ok((adapter, spec.config.clone()))
    }

    async fn run_stages(
        &self,
        case: &TestCase,
        (adapter, raw_config): (Arc<dyn Adapter>, Map<String, Value>),
        ctx: &ExecutionContext,
    ) -> Result<(AdapterResult, Option<Evaluation>), Interrupted> {
        let variables = adapters::build_variables(case, &ctx.variables);
        let config = adapters::resolve(&raw_config, &variables)?;

        let deadline = adapters::configured_timeout(&config).unwrap_or_else(|| self.config.adapter_timeout());
        let prepared = tokio::time::timeout(deadline, adapter.setup(&config))
            .await
            .unwrap_or_else(|_| Err(format!("timed out after {:.1}s", deadline.as_secs_f64())));
        if let Err(e) = prepared {
            return Err(Interrupted::new(
                ErrorKind::Adapter,
                format!("adapter '{}' setup failed: {e}", adapter.kind()),
            ));
        }

        let invocation = self.invoke_with_retry(case, adapter.as_ref(), &config, variables, ctx).await;
        if !invocation.success {
            let message = invocation
                .error
                .clone()
                .unwrap_or_else(|| "adapter reported failure".to_string());
            return Err(Interrupted {
                kind: ErrorKind::Adapter,
                message,
                actual_output: invocation.actual_output,
                metadata: invocation.metadata,
            });
        }

        if case.metrics.is_empty() {
            return Ok((invocation, None));
        }

        let request = EvaluationRequest::for_case(case, &invocation.actual_output);
        let deadline = self.config.evaluation_timeout();
        let evaluated = tokio::time::timeout(deadline, self.evaluator.evaluate(&request))
            .await
            .unwrap_or(Err(EvaluationError::Timeout(deadline)));
        match evaluated {
            Ok(evaluation) => Ok((invocation, Some(evaluation))),
            Err(e) => Err(Interrupted {
                kind: ErrorKind::Evaluation,
                message: e.to_string(),
                actual_output: invocation.actual_output,
                metadata: invocation.metadata,
            }),
        }
    }

    async fn teardown(&self, case: &TestCase, adapter: &dyn Adapter, ctx: &ExecutionContext) {
        let deadline = self.config.adapter_timeout();
        if tokio::time::timeout(deadline, adapter.teardown()).await.is_err() {
            warn!(
                run_id = %ctx.run_id,
                test_case_id = %case.id,
                adapter = adapter.kind(),
                "adapter teardown timed out"
            );
        }
    }

    async fn invoke_with_retry(
        &self,
        case: &TestCase,
        adapter: &dyn Adapter,
        config: &Map<String, Value>,
        variables: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> AdapterResult {
        let deadline = adapters::configured_timeout(config).unwrap_or_else(|| self.config.adapter_timeout());
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut invocation = InvocationContext {
            run_id: ctx.run_id.clone(),
            variables,
            attempt: 1,
        };

        loop {
            let mut result = match tokio::time::timeout(deadline, adapter.invoke(case, config, &invocation)).await {
                Ok(result) => result,
                Err(_) => AdapterResult::failure(format!(
                    "adapter '{}' timed out after {:.1}s",
                    adapter.kind(),
                    deadline.as_secs_f64()
                )),
            };
            result.metadata.insert("attempts".to_string(), invocation.attempt.into());

            if result.success || invocation.attempt >= max_attempts || ctx.cancel.is_cancelled() {
                return result;
            }

            let delay = self.config.retry.backoff(invocation.attempt);
            warn!(
                run_id = %ctx.run_id,
                test_case_id = %case.id,
                attempt = invocation.attempt,
                error = result.error.as_deref().unwrap_or(""),
                delay_ms = delay.as_millis() as u64,
                "adapter failed, retrying"
            );
            tokio::select! {
                _ = ctx.cancel.cancelled() => return result,
                _ = tokio::time::sleep(delay) => {}
            }
            invocation.attempt += 1;
        }
    }
}

fn finish(
    case: &TestCase,
    ctx: &ExecutionContext,
    outcome: Result<(AdapterResult, Option<Evaluation>), Interrupted>,
    duration: Duration,
) -> TestResult {
    let mut result = match outcome {
        Ok((invocation, evaluation)) => {
            let metrics = score_metrics(case, evaluation.as_ref());
            let status = if metrics.values().all(|m| m.passed) {
                TestStatus::Passed
            } else {
                TestStatus::Failed
            };
            let mut metadata = invocation.metadata;
            if let Some(model) = evaluation.and_then(|e| e.model) {
                metadata.insert("evaluation_model".to_string(), model);
            }
            TestResult {
                test_case_id: case.id.clone(),
                status,
                metrics,
                duration,
                actual_output: invocation.actual_output,
                expected_output: None,
                error: None,
                error_kind: None,
                metadata,
                timestamp: Utc::now(),
            }
        }
        Err(stop) => {
            let mut result = TestResult::errored(case.id.clone(), stop.kind, stop.message);
            result.actual_output = stop.actual_output;
            result.metadata = stop.metadata;
            result
        }
    };
    result.duration = duration;
    result.expected_output = case.expected_output.clone();
    result
        .metadata
        .insert("run_id".to_string(), Value::String(ctx.run_id.clone()));
    result
}

/// Per-metric scores for the requested metrics only. A case threshold wins
/// over the service's own verdict.
fn score_metrics(
    case: &TestCase,
    evaluation: Option<&Evaluation>,
) -> std::collections::BTreeMap<String, MetricScore> {
    case.metrics
        .iter()
        .map(|name| {
            let threshold = case.thresholds.get(name).copied();
            let score = match evaluation.and_then(|e| e.metrics.get(name)) {
                Some(verdict) => MetricScore {
                    score: verdict.score,
                    passed: threshold.map_or(verdict.passed, |t| verdict.score >= t),
                    threshold: threshold.or(verdict.threshold),
                    reason: verdict.reason.clone(),
                },
                None => MetricScore {
                    score: 0.0,
                    passed: false,
                    threshold,
                    reason: Some(MISSING_METRIC_REASON.to_string()),
                },
            };
            (name.clone(), score)
        })
        .collect()
}
