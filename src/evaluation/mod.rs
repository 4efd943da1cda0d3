//! Evaluation collaborator -- scores a captured output against metrics.
//!
//! The engine only depends on the [`Evaluator`] trait; [`HttpEvaluator`]
//! talks to a DeepEval-compatible scoring service.

pub mod client;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::TestCase;

pub use self::client::{HttpEvaluator, MetricInfo};

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluation service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("evaluation service rejected the request: {0}")]
    Rejected(String),

    #[error("evaluation service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid evaluation response: {0}")]
    InvalidResponse(String),

    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),
}

/// One scoring request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRequest {
    pub input: String,
    pub actual_output: String,
    pub expected_output: Option<String>,
    pub retrieval_context: Option<Vec<String>>,
    pub metrics: Vec<String>,
    pub thresholds: BTreeMap<String, f64>,
}

impl EvaluationRequest {
    pub fn for_case(case: &TestCase, actual_output: &str) -> Self {
        Self {
            input: case.input.clone(),
            actual_output: actual_output.to_string(),
            expected_output: case.expected_output.clone(),
            retrieval_context: case.retrieval_context.clone(),
            metrics: case.metrics.iter().cloned().collect(),
            thresholds: case.thresholds.clone(),
        }
    }
}

/// Service verdict for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricVerdict {
    pub score: f64,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Scores for every metric the service returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub metrics: BTreeMap<String, MetricVerdict>,
    /// Judge model details, when the service reports them.
    pub model: Option<serde_json::Value>,
}

/// Remote or local scoring backend. Must tolerate many concurrent calls.
#[async_trait::async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Evaluation, EvaluationError>;

    /// Score several requests; the default evaluates them one by one.
    async fn evaluate_batch(
        &self,
        requests: &[EvaluationRequest],
    ) -> Result<Vec<Evaluation>, EvaluationError> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            out.push(self.evaluate(request).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(f64);

    #[async_trait::async_trait]
    impl Evaluator for Constant {
        async fn evaluate(&self, request: &EvaluationRequest) -> Result<Evaluation, EvaluationError> {
            let metrics = request
                .metrics
                .iter()
                .map(|m| {
                    let verdict = MetricVerdict {
                        score: self.0,
                        passed: self.0 >= 0.5,
                        threshold: None,
                        reason: None,
                    };
                    (m.clone(), verdict)
                })
                .collect();
            Ok(Evaluation { metrics, model: None })
        }
    }

    #[test]
    fn test_request_from_case() {
        let case = TestCase::new("tc", "q")
            .with_expected("a")
            .with_threshold("answer_relevancy", 0.7)
            .with_metric("faithfulness");
        let req = EvaluationRequest::for_case(&case, "out");
        assert_eq!(req.metrics, vec!["answer_relevancy", "faithfulness"]);
        assert_eq!(req.thresholds["answer_relevancy"], 0.7);
        assert_eq!(req.expected_output.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_default_batch_preserves_order() {
        let case = TestCase::new("tc", "q").with_metric("m");
        let requests = vec![
            EvaluationRequest::for_case(&case, "one"),
            EvaluationRequest::for_case(&case, "two"),
        ];
        let results = Constant(0.9).evaluate_batch(&requests).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|e| e.metrics["m"].passed));
    }
}
