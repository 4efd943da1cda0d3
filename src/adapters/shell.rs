//! Shell adapter: run a CLI tool and capture its stdout.
//!
//! Config keys: `command` (required), `args`, `env`, `stdin`,
//! `response_path` (parse stdout as JSON and extract), `timeout`.
//! The child is killed if the invocation is dropped (timeout or cancellation).

use std::process::Stdio;

use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Adapter, AdapterResult, InvocationContext};
use crate::model::TestCase;

pub const KIND: &str = "shell";

pub struct ShellAdapter;

impl ShellAdapter {
    async fn run(&self, config: &Map<String, Value>) -> Result<AdapterResult, String> {
        let command = super::required_str(KIND, config, "command").map_err(|e| e.to_string())?;
        let args: Vec<String> = config
            .get("args")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(super::value_to_text).collect())
            .unwrap_or_default();

        let mut cmd = Command::new(command);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = config.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                cmd.env(key, super::value_to_text(value));
            }
        }
        let stdin = config.get("stdin").map(super::value_to_text);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to execute '{command}': {e}"))?;
        // Feed stdin while stdout and stderr drain, or a chatty child deadlocks on a full pipe.
        let pipe = child.stdin.take();
        let feed = async move {
            match (stdin, pipe) {
                (Some(input), Some(mut pipe)) => pipe.write_all(input.as_bytes()).await,
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| format!("waiting for '{command}': {e}"))?;
        if let Err(e) = fed {
            // The child may exit without reading everything; its exit status tells the story.
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(format!("writing stdin: {e}"));
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let actual_output = match config.get("response_path").and_then(Value::as_str) {
            Some(path) => serde_json::from_str::<Value>(&stdout)
                .ok()
                .and_then(|json| super::extract_path(&json, path).map(super::value_to_text))
                .unwrap_or_else(|| stdout.clone()),
            None => stdout.trim().to_string(),
        };

        let mut result = if output.status.success() {
            AdapterResult::ok(actual_output)
        } else {
            let mut failed = AdapterResult::failure(format!(
                "'{command}' exited with {}: {}",
                output.status,
                stderr.trim()
            ));
            failed.actual_output = actual_output;
            failed
        };
        result = result
            .with_meta("command", command)
            .with_meta("args", args)
            .with_meta("return_code", output.status.code())
            .with_meta("stderr", stderr);
        Ok(result)
    }
}

#[async_trait::async_trait]
impl Adapter for ShellAdapter {
    fn kind(&self) -> &str {
        KIND
    }

    async fn invoke(
        &self,
        _case: &TestCase,
        config: &Map<String, Value>,
        _ctx: &InvocationContext,
    ) -> AdapterResult {
        match self.run(config).await {
            Ok(result) => result,
            Err(e) => AdapterResult::failure(e),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    async fn invoke(config: Value) -> AdapterResult {
        ShellAdapter
            .invoke(
                &TestCase::new("tc", "q"),
                config.as_object().unwrap(),
                &InvocationContext::default(),
            )
            .await
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let res = invoke(json!({"command": "echo", "args": ["hello", "world"]})).await;
        assert!(res.success, "{:?}", res.error);
        assert_eq!(res.actual_output, "hello world");
        assert_eq!(res.metadata["return_code"], 0);
    }

    #[tokio::test]
    async fn test_json_response_path() {
        let res = invoke(json!({
            "command": "sh",
            "args": ["-c", "printf '{\"result\":{\"text\":\"Paris\"}}'"],
            "response_path": "result.text"
        }))
        .await;
        assert!(res.success);
        assert_eq!(res.actual_output, "Paris");
    }

    #[tokio::test]
    async fn test_stdin_and_env() {
        let res = invoke(json!({
            "command": "sh",
            "args": ["-c", "read line; echo \"$PREFIX$line\""],
            "env": {"PREFIX": "> "},
            "stdin": "question\n"
        }))
        .await;
        assert!(res.success);
        assert_eq!(res.actual_output, "> question");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let res = invoke(json!({"command": "sh", "args": ["-c", "echo oops >&2; exit 3"]})).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("oops"));
        assert_eq!(res.metadata["return_code"], 3);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let res = invoke(json!({"command": "/definitely/not/here"})).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("failed to execute"));
    }

    #[tokio::test]
    async fn test_large_stdin_does_not_block_on_full_stdout() {
        let payload = "x".repeat(1 << 20);
        let res = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            invoke(json!({"command": "cat", "stdin": payload})),
        )
        .await
        .expect("shell adapter stalled on a large stdin");
        assert!(res.success, "{:?}", res.error);
        assert_eq!(res.actual_output.len(), 1 << 20);
    }
}
