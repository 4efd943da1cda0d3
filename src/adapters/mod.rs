//! Adapters -- the pluggable "trigger" side of a test.
//!
//! An adapter turns a test case plus its resolved configuration into an
//! actual output. Every variant (mock fixture, HTTP endpoint, shell command,
//! in-process function) implements [`Adapter`], and the [`AdapterRegistry`]
//! maps a configuration type tag to the factory that builds it.

pub mod function;
pub mod http;
pub mod mock;
pub mod shell;
pub mod substitute;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::TestCase;

pub use self::function::{FunctionCall, FunctionTable};
pub use self::substitute::{build_variables, resolve};

/// Configuration problems attributed to a single test case (or, when found
/// while validating a whole suite, to the run).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown adapter type '{kind}' (available: {available})")]
    UnknownAdapter { kind: String, available: String },

    #[error("no adapter configured for test case '{test_case_id}'")]
    MissingAdapter { test_case_id: String },

    #[error("{adapter} adapter requires '{key}' in its config")]
    MissingKey { adapter: String, key: String },

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("unresolved variable(s) in adapter config: {}", .tokens.join(", "))]
    UnresolvedVariables { tokens: Vec<String> },
}

/// Output of one adapter invocation. Ephemeral: consumed by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResult {
    pub actual_output: String,
    pub metadata: Map<String, Value>,
    pub success: bool,
    pub error: Option<String>,
}

impl AdapterResult {
    pub fn ok(actual_output: impl Into<String>) -> Self {
        Self {
            actual_output: actual_output.into(),
            metadata: Map::new(),
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        let mut metadata = Map::new();
        metadata.insert("error_details".to_string(), Value::String(error.clone()));
        Self {
            actual_output: String::new(),
            metadata,
            success: false,
            error: Some(error),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Per-invocation context handed to adapters alongside the resolved config.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub run_id: String,
    /// Variables the configuration was resolved against.
    pub variables: Map<String, Value>,
    /// 1-based attempt number when retries are enabled.
    pub attempt: u32,
}

/// The capability every system-under-test trigger provides.
///
/// Implementations must be safe to call concurrently and must report failures
/// through [`AdapterResult::failure`] rather than panicking. The config passed
/// in has already been resolved; adapters never substitute placeholders.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// Registry tag of this adapter.
    fn kind(&self) -> &str;

    /// Acquire per-execution resources (a browser session, a socket) before
    /// the first `invoke`. An error marks the test errored without invoking.
    async fn setup(&self, _config: &Map<String, Value>) -> Result<(), String> {
        Ok(())
    }

    async fn invoke(
        &self,
        case: &TestCase,
        config: &Map<String, Value>,
        ctx: &InvocationContext,
    ) -> AdapterResult;

    /// Release whatever `setup` acquired. Called exactly once per execution on
    /// every exit path, so it must tolerate a setup that failed or never ran.
    async fn teardown(&self) {}
}

/// Builds an adapter instance for one execution.
pub type AdapterFactory = Arc<dyn Fn() -> Arc<dyn Adapter> + Send + Sync>;

/// Name -> factory mapping for adapter types.
#[derive(Clone)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
    functions: FunctionTable,
}

impl AdapterRegistry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
            functions: FunctionTable::default(),
        }
    }

    /// A registry with the built-in `mock`, `http`, `shell` and `function` adapters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(mock::KIND, || Arc::new(mock::MockAdapter));
        let http = Arc::new(http::HttpAdapter::default());
        registry.register(http::KIND, move || http.clone());
        registry.register(shell::KIND, || Arc::new(shell::ShellAdapter));
        registry.install_function_adapter();
        registry
    }

    /// Register (or replace) a factory under `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Adapter> + Send + Sync + 'static,
    {
        tracing::debug!(%kind, "registering adapter");
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    /// Register a shared adapter instance under its own `kind()`.
    pub fn register_adapter(&mut self, adapter: Arc<dyn Adapter>) {
        let kind = adapter.kind().to_string();
        self.register(&kind, move || adapter.clone());
    }

    /// Expose an async Rust function to suites through the `function` adapter.
    pub fn register_function<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(FunctionCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.functions.insert(name, f);
        self.install_function_adapter();
    }

    fn install_function_adapter(&mut self) {
        let adapter = Arc::new(function::FunctionAdapter::new(self.functions.clone()));
        self.register(function::KIND, move || adapter.clone());
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered type tags, sorted.
    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Build the adapter registered under `kind`.
    pub fn create(&self, kind: &str) -> Result<Arc<dyn Adapter>, ConfigError> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownAdapter {
                kind: kind.to_string(),
                available: self.kinds().join(", "),
            })
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ---------------------------------------------------------------------------
// Config helpers shared by the built-in adapters
// ---------------------------------------------------------------------------

pub(crate) fn required_str<'a>(
    adapter: &str,
    config: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, ConfigError> {
    match config.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: "expected a string".to_string(),
        }),
        None => Err(ConfigError::MissingKey {
            adapter: adapter.to_string(),
            key: key.to_string(),
        }),
    }
}

/// Per-adapter deadline from a `timeout` key (seconds), if present and valid.
pub fn configured_timeout(config: &Map<String, Value>) -> Option<Duration> {
    let secs = match config.get("timeout")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('s').parse().ok()?,
        _ => return None,
    };
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// Walk a dotted path such as `choices.0.message.content` or `data[1].text`.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (name, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !name.is_empty() {
            current = match current {
                Value::Object(map) => map.get(name)?,
                Value::Array(items) => items.get(name.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        for idx in indices.split('[').filter(|s| !s.is_empty()) {
            let idx: usize = idx.trim_end_matches(']').parse().ok()?;
            current = current.as_array()?.get(idx)?;
        }
    }
    Some(current)
}

/// Render a JSON value as adapter output text.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
