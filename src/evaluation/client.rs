//! HTTP client for a DeepEval-compatible evaluation service.
//!
//! Endpoints: `POST /api/v1/evaluation/single`, `POST /api/v1/evaluation/batch`,
//! `GET /api/v1/evaluation/metrics`, `GET /health`.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{Evaluation, EvaluationError, EvaluationRequest, Evaluator, MetricVerdict};
use crate::config::EvaluationConfig;

/// Metric advertised by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

// Wire shapes -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireMetric {
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(default)]
    metrics: BTreeMap<String, WireMetric>,
    #[serde(default)]
    model_used: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SingleResponse {
    result: WireResult,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    results: Vec<WireResult>,
}

#[derive(Debug, Deserialize)]
struct MetricsResponse {
    metrics: Vec<MetricInfo>,
}

impl From<WireResult> for Evaluation {
    fn from(wire: WireResult) -> Self {
        let metrics = wire
            .metrics
            .into_iter()
            .map(|(name, m)| {
                let score = m.score.unwrap_or(0.0);
                let passed = m
                    .success
                    .unwrap_or_else(|| m.threshold.map_or(false, |t| score >= t));
                let verdict = MetricVerdict {
                    score,
                    passed,
                    threshold: m.threshold,
                    reason: m.reason,
                };
                (name, verdict)
            })
            .collect();
        Evaluation {
            metrics,
            model: wire.model_used,
        }
    }
}

// Client ----------------------------------------------------------------------

/// Async client for the scoring service; cheap to clone.
#[derive(Clone)]
pub struct HttpEvaluator {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpEvaluator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EvaluationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &EvaluationConfig) -> Result<Self, EvaluationError> {
        Self::new(&config.base_url, Duration::from_secs(config.timeout_secs))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `true` when `GET /health` answers 200.
    pub async fn health_check(&self) -> bool {
        match self.client.get(format!("{}/health", self.base_url)).send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                debug!(error = %e, "evaluation service health check failed");
                false
            }
        }
    }

    pub async fn list_metrics(&self) -> Result<Vec<MetricInfo>, EvaluationError> {
        let resp = self
            .client
            .get(format!("{}/api/v1/evaluation/metrics", self.base_url))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        let body: MetricsResponse = self.decode(resp).await?;
        Ok(body.metrics)
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        payload: &Value,
    ) -> Result<T, EvaluationError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(payload)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        self.decode(resp).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, EvaluationError> {
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.map_transport(e))?;
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(EvaluationError::Rejected(error_detail(&body)));
        }
        if !status.is_success() {
            return Err(EvaluationError::Status {
                status: status.as_u16(),
                body: error_detail(&body),
            });
        }
        serde_json::from_str(&body).map_err(|e| EvaluationError::InvalidResponse(e.to_string()))
    }

    fn map_transport(&self, e: reqwest::Error) -> EvaluationError {
        if e.is_timeout() {
            EvaluationError::Timeout(self.timeout)
        } else {
            EvaluationError::Transport(e)
        }
    }
}

/// The service scores every metric against a single `threshold` kwarg, so one
/// is only sent when all declared thresholds agree.
fn metric_kwargs(thresholds: &BTreeMap<String, f64>) -> Option<Value> {
    let mut values = thresholds.values();
    let first = *values.next()?;
    values
        .all(|t| *t == first)
        .then(|| json!({ "threshold": first }))
}

fn case_payload(request: &EvaluationRequest) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("input".into(), Value::String(request.input.clone()));
    payload.insert(
        "actual_output".into(),
        Value::String(request.actual_output.clone()),
    );
    if let Some(expected) = &request.expected_output {
        payload.insert("expected_output".into(), Value::String(expected.clone()));
    }
    if let Some(ctx) = &request.retrieval_context {
        payload.insert("retrieval_context".into(), json!(ctx));
    }
    payload
}

fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").map(crate::adapters::value_to_text))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait::async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Evaluation, EvaluationError> {
        let mut payload = case_payload(request);
        payload.insert("metrics".into(), json!(request.metrics));
        if let Some(kwargs) = metric_kwargs(&request.thresholds) {
            payload.insert("metric_kwargs".into(), kwargs);
        }
        let resp: SingleResponse = self
            .post("/api/v1/evaluation/single", &Value::Object(payload))
            .await?;
        Ok(resp.result.into())
    }

    async fn evaluate_batch(
        &self,
        requests: &[EvaluationRequest],
    ) -> Result<Vec<Evaluation>, EvaluationError> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        // One batch call only works when every case asks for the same metrics.
        let uniform = requests
            .iter()
            .all(|r| r.metrics == first.metrics && r.thresholds == first.thresholds);
        if !uniform {
            let mut out = Vec::with_capacity(requests.len());
            for request in requests {
                out.push(self.evaluate(request).await?);
            }
            return Ok(out);
        }

        let cases: Vec<Value> = requests
            .iter()
            .map(|r| Value::Object(case_payload(r)))
            .collect();
        let mut payload = json!({ "test_cases": cases, "metrics": first.metrics });
        if let Some(kwargs) = metric_kwargs(&first.thresholds) {
            payload["metric_kwargs"] = kwargs;
        }
        let resp: BatchResponse = self.post("/api/v1/evaluation/batch", &payload).await?;
        if resp.results.len() != requests.len() {
            return Err(EvaluationError::InvalidResponse(format!(
                "expected {} batch results, got {}",
                requests.len(),
                resp.results.len()
            )));
        }
        Ok(resp.results.into_iter().map(Evaluation::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestCase;
    use axum::{http::StatusCode as AxumStatus, routing::{get, post}, Json, Router};

    async fn spawn_service() -> String {
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/api/v1/evaluation/single",
                post(|Json(body): Json<Value>| async move {
                    if body["actual_output"] == "" {
                        return Err((AxumStatus::BAD_REQUEST, Json(json!({"detail": "empty output"}))));
                    }
                    let threshold = body["metric_kwargs"]["threshold"].as_f64().unwrap_or(0.5);
                    let metrics: Map<String, Value> = body["metrics"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|m| {
                            let name = m.as_str().unwrap().to_string();
                            (name, json!({"score": 0.8, "reason": "good", "success": 0.8 >= threshold}))
                        })
                        .collect();
                    Ok(Json(json!({
                        "result": {"metrics": metrics, "model_used": {"provider": "ollama"}},
                        "status": "success"
                    })))
                }),
            )
            .route(
                "/api/v1/evaluation/batch",
                post(|Json(body): Json<Value>| async move {
                    let results: Vec<Value> = body["test_cases"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|_| json!({"metrics": {"answer_relevancy": {"score": 0.4, "reason": "meh", "success": false}}}))
                        .collect();
                    let total = results.len();
                    Json(json!({"results": results, "total_cases": total, "status": "success"}))
                }),
            )
            .route(
                "/api/v1/evaluation/metrics",
                get(|| async {
                    Json(json!({"metrics": [{"name": "answer_relevancy", "description": "relevance"}], "total_metrics": 1}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request(output: &str, threshold: f64) -> EvaluationRequest {
        let case = TestCase::new("tc_001", "What is the capital of France?")
            .with_threshold("answer_relevancy", threshold);
        EvaluationRequest::for_case(&case, output)
    }

    #[tokio::test]
    async fn test_single_evaluation() {
        let base = spawn_service().await;
        let evaluator = HttpEvaluator::new(&base, Duration::from_secs(5)).unwrap();

        let eval = evaluator.evaluate(&request("Paris", 0.7)).await.unwrap();
        let verdict = &eval.metrics["answer_relevancy"];
        assert_eq!(verdict.score, 0.8);
        assert!(verdict.passed);
        assert_eq!(verdict.reason.as_deref(), Some("good"));

        // The threshold travels as metric_kwargs and changes the service verdict.
        let strict = evaluator.evaluate(&request("Paris", 0.9)).await.unwrap();
        assert!(!strict.metrics["answer_relevancy"].passed);
    }

    #[tokio::test]
    async fn test_rejection_maps_to_error() {
        let base = spawn_service().await;
        let evaluator = HttpEvaluator::new(&base, Duration::from_secs(5)).unwrap();
        let err = evaluator.evaluate(&request("", 0.5)).await.unwrap_err();
        assert!(matches!(err, EvaluationError::Rejected(ref d) if d == "empty output"));
    }

    #[tokio::test]
    async fn test_batch_and_metrics_listing() {
        let base = spawn_service().await;
        let evaluator = HttpEvaluator::new(&base, Duration::from_secs(5)).unwrap();

        let results = evaluator
            .evaluate_batch(&[request("a", 0.5), request("b", 0.5)])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(!results[1].metrics["answer_relevancy"].passed);

        let metrics = evaluator.list_metrics().await.unwrap();
        assert_eq!(metrics[0].name, "answer_relevancy");
        assert!(evaluator.health_check().await);
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let evaluator = HttpEvaluator::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        assert!(!evaluator.health_check().await);
        assert!(evaluator.evaluate(&request("x", 0.5)).await.is_err());
    }

    #[test]
    fn test_metric_kwargs_only_for_uniform_thresholds() {
        let mut t = BTreeMap::new();
        assert_eq!(metric_kwargs(&t), None);
        t.insert("a".to_string(), 0.7);
        t.insert("b".to_string(), 0.7);
        assert_eq!(metric_kwargs(&t), Some(json!({"threshold": 0.7})));
        t.insert("c".to_string(), 0.2);
        assert_eq!(metric_kwargs(&t), None);
    }
}
