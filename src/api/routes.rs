//! API route definitions.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::state::AppState;
use crate::model::{RunStatus, TestRun};
use crate::report::{self, ExportFormat};
use crate::runner::{ProgressEvent, RunError, RunOptions};
use crate::storage::StoreError;
use crate::suite::{self, SuiteError};

const DEFAULT_LIMIT: usize = 50;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/adapters", get(list_adapters))
        .route("/metrics", get(list_metrics))
        .route("/suites", get(list_suites))
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/results", get(get_results))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/events", get(run_events))
        .route("/runs/{id}/export", get(export_run))
        .route("/history/{test_case_id}", get(history))
        .route("/stats/overview", get(stats_overview))
        .route("/stats/by-suite", get(stats_by_suite))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: &str, id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} '{id}' not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": { "status": self.status.as_u16(), "message": self.message },
            "meta": { "timestamp": chrono::Utc::now().to_rfc3339() }
        }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        warn!(error = %e, "store query failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<SuiteError> for ApiError {
    fn from(e: SuiteError) -> Self {
        let status = match e {
            SuiteError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<RunError> for ApiError {
    fn from(e: RunError) -> Self {
        let status = match e {
            RunError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

// ---------------------------------------------------------------------------
// Service info
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    let evaluation = match &state.evaluator {
        Some(client) => json!({
            "base_url": client.base_url(),
            "reachable": client.health_check().await,
        }),
        None => Value::Null,
    };
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "active_runs": state.active.read().await.len(),
            "evaluation_service": evaluation,
        },
        "meta": meta()
    }))
}

async fn list_adapters(State(state): State<AppState>) -> Json<Value> {
    let kinds = state.runner.registry().kinds();
    Json(json!({ "data": kinds, "meta": { "total": kinds.len() } }))
}

async fn list_metrics(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let client = state
        .evaluator
        .as_ref()
        .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "no evaluation service configured"))?;
    let metrics = client
        .list_metrics()
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?;
    Ok(Json(json!({ "data": metrics, "meta": { "total": metrics.len() } })))
}

async fn list_suites(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let dir = state.config.server.suites_dir.clone();
    let suites = tokio::task::spawn_blocking(move || suite::load_dir(&dir))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    let data: Vec<Value> = suites
        .iter()
        .map(|(path, s)| {
            json!({
                "name": s.name,
                "version": s.version,
                "file": path.file_name().map(|f| f.to_string_lossy().into_owned()),
                "test_cases": s.cases.len(),
                "metadata": s.metadata,
            })
        })
        .collect();
    Ok(Json(json!({ "data": data, "meta": { "total": data.len() } })))
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    suite_name: String,
    #[serde(default)]
    test_ids: Option<Vec<String>>,
    #[serde(default)]
    max_concurrency: Option<usize>,
    #[serde(default)]
    variables: Map<String, Value>,
}

async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let dir = state.config.server.suites_dir.clone();
    let name = req.suite_name.clone();
    let suite = tokio::task::spawn_blocking(move || suite::find_by_name(&dir, &name))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    let only: Option<BTreeSet<String>> = req.test_ids.map(|ids| ids.into_iter().collect());
    if let Some(only) = &only {
        if !suite.cases.iter().any(|c| only.contains(&c.id)) {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "no test cases to run"));
        }
    }

    let total = suite.cases.len();
    let suite_name = suite.name.clone();
    let options = RunOptions {
        only,
        variables: req.variables,
        max_concurrency: req.max_concurrency,
        cancel: CancellationToken::new(),
        ..Default::default()
    };
    let run_id = state.start_run(suite, options).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "data": {
                "run_id": run_id,
                "suite_name": suite_name,
                "status": RunStatus::Running,
                "total": total,
            },
            "meta": meta()
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    suite: Option<String>,
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<ListRunsQuery>,
) -> ApiResult<Json<Value>> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT);
    let runs = state
        .query(move |store| store.list_runs(q.suite.as_deref(), limit))
        .await?;
    Ok(Json(json!({ "data": runs, "meta": { "total": runs.len(), "limit": limit } })))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let run_id = id.clone();
    let run = state
        .query(move |store| store.get_run(&run_id))
        .await?
        .ok_or_else(|| ApiError::not_found("run", &id))?;
    let active = state.active.read().await.contains_key(&id);
    Ok(Json(json!({
        "data": { "run": run, "summary": run.summary() },
        "meta": { "active": active, "timestamp": chrono::Utc::now().to_rfc3339() }
    })))
}

async fn get_results(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let run_id = id.clone();
    let (run, results) = state
        .query(move |store| Ok((store.get_run(&run_id)?, store.get_results(&run_id)?)))
        .await?;
    if run.is_none() {
        return Err(ApiError::not_found("run", &id));
    }
    Ok(Json(json!({ "data": results, "meta": { "total": results.len() } })))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if let Some(run) = state.active.read().await.get(&id) {
        run.cancel.cancel();
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "data": { "run_id": id, "cancelling": true }, "meta": meta() })),
        ));
    }
    let run_id = id.clone();
    match state.query(move |store| store.get_run(&run_id)).await? {
        Some(run) => Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("run '{id}' is already {}", run.status),
        )),
        None => Err(ApiError::not_found("run", &id)),
    }
}

fn sse_event(event: &ProgressEvent) -> Event {
    let name = match event {
        ProgressEvent::TestCompleted { .. } => "test_completed",
        ProgressEvent::RunCompleted { .. } => "run_completed",
    };
    Event::default()
        .event(name)
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event(name))
}

/// Server-sent progress for a run. A finished run yields its final summary.
async fn run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let live = state
        .active
        .read()
        .await
        .get(&id)
        .map(|run| run.events.subscribe());

    let stream = match live {
        Some(rx) => stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let done = event.is_terminal();
                        return Some((sse_event(&event), if done { None } else { Some(rx) }));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "SSE subscriber lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed(),
        None => {
            let run_id = id.clone();
            let run = state
                .query(move |store| store.get_run(&run_id))
                .await?
                .ok_or_else(|| ApiError::not_found("run", &id))?;
            let event = ProgressEvent::RunCompleted {
                run_id: run.id.clone(),
                summary: run.summary(),
            };
            stream::once(async move { sse_event(&event) }).boxed()
        }
    };

    Ok(Sse::new(stream.map(Ok)).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

async fn export_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ExportQuery>,
) -> ApiResult<Response> {
    let format: ExportFormat = q
        .format
        .as_deref()
        .unwrap_or("json")
        .parse()
        .map_err(|e: String| ApiError::new(StatusCode::BAD_REQUEST, e))?;
    let run_id = id.clone();
    let (run, results) = state
        .query(move |store| Ok((store.get_run(&run_id)?, store.get_results(&run_id)?)))
        .await?;
    let run = run.ok_or_else(|| ApiError::not_found("run", &id))?;

    let body = report::export(&run, &results, format)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Html => "text/html; charset=utf-8",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    Path(test_case_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT);
    let id = test_case_id.clone();
    let entries = state.query(move |store| store.get_history(&id, limit)).await?;
    let passed = entries.iter().filter(|e| e.result.passed()).count();
    Ok(Json(json!({
        "data": entries,
        "meta": { "test_case_id": test_case_id, "total": entries.len(), "passed": passed, "limit": limit }
    })))
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Runs considered by the stats endpoints, most recent first.
const STATS_WINDOW: usize = 100;

#[derive(Debug, Default, Serialize)]
struct RunTotals {
    runs: usize,
    tests: usize,
    passed: usize,
    failed: usize,
    errored: usize,
    skipped: usize,
    /// Percentage of tests passed, two decimals.
    pass_rate: f64,
}

impl RunTotals {
    fn add(&mut self, run: &TestRun) {
        self.runs += 1;
        self.tests += run.total;
        self.passed += run.passed;
        self.failed += run.failed;
        self.errored += run.errored;
        self.skipped += run.skipped;
        self.pass_rate = if self.tests == 0 {
            0.0
        } else {
            (self.passed as f64 / self.tests as f64 * 10_000.0).round() / 100.0
        };
    }
}

async fn stats_overview(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let runs = state.query(|store| store.list_runs(None, STATS_WINDOW)).await?;
    let mut totals = RunTotals::default();
    for run in &runs {
        totals.add(run);
    }
    let recent: Vec<_> = runs.iter().take(10).map(TestRun::summary).collect();
    Ok(Json(json!({
        "data": { "totals": totals, "recent_runs": recent },
        "meta": { "window": STATS_WINDOW }
    })))
}

async fn stats_by_suite(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let runs = state.query(|store| store.list_runs(None, STATS_WINDOW)).await?;
    let mut suites: BTreeMap<String, RunTotals> = BTreeMap::new();
    for run in &runs {
        suites.entry(run.suite_name.clone()).or_default().add(run);
    }
    Ok(Json(json!({
        "data": suites,
        "meta": { "total": suites.len(), "window": STATS_WINDOW }
    })))
}
