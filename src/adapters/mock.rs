//! Mock / fixture adapter for offline suites and tests.
//!
//! Config keys:
//! - `actual_output`: literal output, or
//! - `fixture_file`: path whose contents are the output
//! - `delay_ms` (optional): simulated latency before answering
//! - `error` (optional): fail with this message instead of answering

use std::time::Duration;

use serde_json::{Map, Value};

use super::{Adapter, AdapterResult, InvocationContext};
use crate::model::TestCase;

pub const KIND: &str = "mock";

pub struct MockAdapter;

#[async_trait::async_trait]
impl Adapter for MockAdapter {
    fn kind(&self) -> &str {
        KIND
    }

    async fn invoke(
        &self,
        _case: &TestCase,
        config: &Map<String, Value>,
        _ctx: &InvocationContext,
    ) -> AdapterResult {
        if let Some(ms) = config.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        if let Some(message) = config.get("error").and_then(Value::as_str) {
            return AdapterResult::failure(message).with_meta("adapter_type", KIND);
        }

        let (output, fixture) = if let Some(value) = config.get("actual_output") {
            (super::value_to_text(value), None)
        } else if let Some(path) = config.get("fixture_file").and_then(Value::as_str) {
            match tokio::fs::read_to_string(path).await {
                Ok(text) => (text, Some(path.to_string())),
                Err(e) => {
                    return AdapterResult::failure(format!("fixture file {path}: {e}"))
                        .with_meta("adapter_type", KIND)
                }
            }
        } else {
            return AdapterResult::failure(
                "mock adapter requires 'actual_output' or 'fixture_file' in its config",
            )
            .with_meta("adapter_type", KIND);
        };

        AdapterResult::ok(output)
            .with_meta("adapter_type", KIND)
            .with_meta("fixture_file", fixture.map(Value::String).unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    async fn invoke(config: Value) -> AdapterResult {
        let case = TestCase::new("tc", "q");
        MockAdapter
            .invoke(&case, config.as_object().unwrap(), &InvocationContext::default())
            .await
    }

    #[tokio::test]
    async fn test_literal_output() {
        let res = invoke(json!({"actual_output": "Paris"})).await;
        assert!(res.success);
        assert_eq!(res.actual_output, "Paris");
        assert_eq!(res.metadata["adapter_type"], "mock");
    }

    #[tokio::test]
    async fn test_fixture_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "from fixture").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let res = invoke(json!({"fixture_file": path})).await;
        assert!(res.success);
        assert_eq!(res.actual_output, "from fixture");
    }

    #[tokio::test]
    async fn test_missing_fixture_is_failure_not_panic() {
        let res = invoke(json!({"fixture_file": "/nonexistent/fixture.txt"})).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("/nonexistent/fixture.txt"));
        assert_eq!(res.actual_output, "");
    }

    #[tokio::test]
    async fn test_missing_config_reports_error() {
        let res = invoke(json!({})).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("actual_output"));
    }

    #[tokio::test]
    async fn test_configured_error() {
        let res = invoke(json!({"error": "upstream 503"})).await;
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("upstream 503"));
    }
}
