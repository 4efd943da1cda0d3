//! `{{token}}` substitution over adapter configuration.
//!
//! Resolution walks the whole configuration tree (nested objects and arrays)
//! and either replaces every placeholder or fails with the full list of
//! unresolved tokens. A failed resolution never yields a partially
//! substituted config.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use super::ConfigError;
use crate::model::TestCase;

const PLACEHOLDER: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}";

fn placeholder() -> Result<&'static Regex, ConfigError> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PLACEHOLDER))
        .as_ref()
        .map_err(|e| ConfigError::InvalidValue {
            key: "placeholder pattern".to_string(),
            reason: e.to_string(),
        })
}

/// Variables visible to one test's adapter config.
///
/// Later sources win: built-ins (`input`, `test_case_id`, `expected_output`),
/// then the case's own `context`, then the run-level variables.
pub fn build_variables(case: &TestCase, run_variables: &Map<String, Value>) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("input".to_string(), Value::String(case.input.clone()));
    vars.insert("test_case_id".to_string(), Value::String(case.id.clone()));
    if let Some(expected) = &case.expected_output {
        vars.insert("expected_output".to_string(), Value::String(expected.clone()));
    }
    for (key, value) in case.context.iter().chain(run_variables.iter()) {
        vars.insert(key.clone(), value.clone());
    }
    vars
}

/// Resolve every placeholder in `config` against `vars`.
pub fn resolve(
    config: &Map<String, Value>,
    vars: &Map<String, Value>,
) -> Result<Map<String, Value>, ConfigError> {
    let re = placeholder()?;
    let mut missing = Vec::new();
    let resolved = resolve_map(re, config, vars, &mut missing);
    if missing.is_empty() {
        Ok(resolved)
    } else {
        missing.sort();
        missing.dedup();
        Err(ConfigError::UnresolvedVariables { tokens: missing })
    }
}

fn resolve_map(
    re: &Regex,
    map: &Map<String, Value>,
    vars: &Map<String, Value>,
    missing: &mut Vec<String>,
) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), resolve_value(re, v, vars, missing)))
        .collect()
}

fn resolve_value(re: &Regex, value: &Value, vars: &Map<String, Value>, missing: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_str(re, s, vars, missing)),
        Value::Object(map) => Value::Object(resolve_map(re, map, vars, missing)),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| resolve_value(re, v, vars, missing)).collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_str(re: &Regex, template: &str, vars: &Map<String, Value>, missing: &mut Vec<String>) -> String {
    re.replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            match lookup(vars, name) {
                Some(value) => super::value_to_text(value),
                None => {
                    missing.push(name.to_string());
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Exact key first, then a dotted walk (`steps.search.output`).
fn lookup<'a>(vars: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(value) = vars.get(name) {
        return Some(value);
    }
    let (head, rest) = name.split_once('.')?;
    super::extract_path(vars.get(head)?, rest)
}
