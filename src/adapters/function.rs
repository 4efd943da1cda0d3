//! Direct-call adapter: dispatch to async Rust functions registered by name.
//!
//! Config keys: `function` (required), `args` (object passed through).

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};

use super::{Adapter, AdapterResult, InvocationContext};
use crate::model::TestCase;

pub const KIND: &str = "function";

/// Arguments handed to a registered function.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub test_case_id: String,
    pub input: String,
    pub args: Map<String, Value>,
}

type BoxedFn = Arc<dyn Fn(FunctionCall) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Named functions available to the `function` adapter.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: BTreeMap<String, BoxedFn>,
}

impl FunctionTable {
    pub fn insert<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(FunctionCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let boxed: BoxedFn = Arc::new(move |call| f(call).boxed());
        self.functions.insert(name.to_string(), boxed);
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    fn get(&self, name: &str) -> Option<&BoxedFn> {
        self.functions.get(name)
    }
}

pub struct FunctionAdapter {
    table: FunctionTable,
}

impl FunctionAdapter {
    pub fn new(table: FunctionTable) -> Self {
        Self { table }
    }
}

#[async_trait::async_trait]
impl Adapter for FunctionAdapter {
    fn kind(&self) -> &str {
        KIND
    }

    async fn invoke(
        &self,
        case: &TestCase,
        config: &Map<String, Value>,
        _ctx: &InvocationContext,
    ) -> AdapterResult {
        let name = match super::required_str(KIND, config, "function") {
            Ok(name) => name,
            Err(e) => return AdapterResult::failure(e.to_string()),
        };
        let Some(function) = self.table.get(name) else {
            return AdapterResult::failure(format!(
                "function '{name}' is not registered (available: {})",
                self.table.names().join(", ")
            ));
        };

        let args = config
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let call = FunctionCall {
            test_case_id: case.id.clone(),
            input: case.input.clone(),
            args: args.clone(),
        };

        match function(call).await {
            Ok(output) => AdapterResult::ok(output)
                .with_meta("function", name)
                .with_meta("args", Value::Object(args)),
            Err(e) => AdapterResult::failure(e).with_meta("function", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> FunctionTable {
        let mut table = FunctionTable::default();
        table.insert("shout", |call: FunctionCall| async move {
            Ok(call.input.to_uppercase())
        });
        table.insert("fail", |_call: FunctionCall| async move {
            Err("model unavailable".to_string())
        });
        table
    }

    async fn invoke(config: Value) -> AdapterResult {
        FunctionAdapter::new(table())
            .invoke(
                &TestCase::new("tc", "hello"),
                config.as_object().unwrap(),
                &InvocationContext::default(),
            )
            .await
    }

    #[tokio::test]
    async fn test_calls_registered_function() {
        let res = invoke(json!({"function": "shout"})).await;
        assert!(res.success);
        assert_eq!(res.actual_output, "HELLO");
    }

    #[tokio::test]
    async fn test_function_error_becomes_failure() {
        let res = invoke(json!({"function": "fail"})).await;
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("model unavailable"));
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let res = invoke(json!({"function": "nope"})).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("shout"));
    }
}
