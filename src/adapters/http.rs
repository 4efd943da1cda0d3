//! HTTP adapter: call a REST endpoint and extract the answer from its JSON.
//!
//! Config keys: `endpoint` (required), `method` (default `POST`), `headers`,
//! `request_body`, `response_path` (default `response`), `timeout` (seconds).

use std::time::{Duration, Instant};

use reqwest::{Client, Method};
use serde_json::{Map, Value};

use super::{Adapter, AdapterResult, ConfigError, InvocationContext};
use crate::model::TestCase;

pub const KIND: &str = "http";

const DEFAULT_RESPONSE_PATH: &str = "response";

/// Shares one connection pool across all invocations.
pub struct HttpAdapter {
    client: Client,
}

impl Default for HttpAdapter {
    fn default() -> Self {
        let client = Client::builder()
            .user_agent(concat!("evalrunner/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl HttpAdapter {
    async fn call(&self, config: &Map<String, Value>) -> Result<AdapterResult, String> {
        let endpoint = super::required_str(KIND, config, "endpoint").map_err(|e| e.to_string())?;
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_uppercase();
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| {
            ConfigError::InvalidValue {
                key: "method".to_string(),
                reason: format!("'{method}' is not an HTTP method"),
            }
            .to_string()
        })?;

        let mut request = self.client.request(method.clone(), endpoint);
        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                request = request.header(name.as_str(), super::value_to_text(value));
            }
        }
        let body = config.get("request_body").cloned();
        if let Some(body) = &body {
            if method != Method::GET {
                request = request.json(body);
            }
        }
        if let Some(timeout) = super::configured_timeout(config) {
            request = request.timeout(timeout);
        }

        let start = Instant::now();
        let response = request.send().await.map_err(|e| format!("request failed: {e}"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("reading response body: {e}"))?;
        let elapsed = start.elapsed();

        if !status.is_success() {
            return Ok(AdapterResult::failure(format!("HTTP {status}: {}", truncate(&text, 200)))
                .with_meta("status_code", status.as_u16()));
        }

        let explicit_path = config.get("response_path").and_then(Value::as_str);
        let (output, full_response) = match serde_json::from_str::<Value>(&text) {
            Ok(json) => {
                let path = explicit_path.unwrap_or(DEFAULT_RESPONSE_PATH);
                let output = super::extract_path(&json, path)
                    .filter(|v| !v.is_null())
                    .map(super::value_to_text)
                    .ok_or_else(|| format!("could not extract output from path '{path}'"))?;
                (output, json)
            }
            Err(_) if explicit_path.is_none() => (text.clone(), Value::String(text)),
            Err(e) => return Err(format!("response is not JSON: {e}")),
        };

        Ok(AdapterResult::ok(output)
            .with_meta("status_code", status.as_u16())
            .with_meta("response_time_ms", millis(elapsed))
            .with_meta("full_response", full_response)
            .with_meta("request_body", body.unwrap_or(Value::Null)))
    }
}

#[async_trait::async_trait]
impl Adapter for HttpAdapter {
    fn kind(&self) -> &str {
        KIND
    }

    async fn invoke(
        &self,
        _case: &TestCase,
        config: &Map<String, Value>,
        _ctx: &InvocationContext,
    ) -> AdapterResult {
        match self.call(config).await {
            Ok(result) => result,
            Err(e) => AdapterResult::failure(e),
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::json;

    async fn spawn_server() -> String {
        let app = Router::new()
            .route(
                "/chat",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({"data": {"answer": format!("echo: {}", body["prompt"].as_str().unwrap_or(""))}}))
                }),
            )
            .route("/plain", post(|| async { "plain text answer" }))
            .route(
                "/broken",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "kaboom") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn invoke(config: Value) -> AdapterResult {
        HttpAdapter::default()
            .invoke(
                &TestCase::new("tc", "q"),
                config.as_object().unwrap(),
                &InvocationContext::default(),
            )
            .await
    }

    #[tokio::test]
    async fn test_extracts_response_path() {
        let base = spawn_server().await;
        let res = invoke(json!({
            "endpoint": format!("{base}/chat"),
            "request_body": {"prompt": "capital of France"},
            "response_path": "data.answer"
        }))
        .await;

        assert!(res.success, "{:?}", res.error);
        assert_eq!(res.actual_output, "echo: capital of France");
        assert_eq!(res.metadata["status_code"], 200);
    }

    #[tokio::test]
    async fn test_plain_text_without_path() {
        let base = spawn_server().await;
        let res = invoke(json!({"endpoint": format!("{base}/plain")})).await;
        assert!(res.success);
        assert_eq!(res.actual_output, "plain text answer");
    }

    #[tokio::test]
    async fn test_http_error_is_failure() {
        let base = spawn_server().await;
        let res = invoke(json!({"endpoint": format!("{base}/broken")})).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_missing_path_is_failure() {
        let base = spawn_server().await;
        let res = invoke(json!({
            "endpoint": format!("{base}/chat"),
            "request_body": {"prompt": "x"},
            "response_path": "data.nope"
        }))
        .await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("data.nope"));
    }

    #[tokio::test]
    async fn test_missing_endpoint() {
        let res = invoke(json!({})).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("endpoint"));
    }
}
