//! Suite files: loading, discovery by name, and structural checks.
//!
//! Suites are TOML (`.toml`) or JSON (`.json`) documents with a top-level
//! `test_cases` array. The suite name comes from `name`, then
//! `metadata.name`, then the file stem.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::model::Suite;

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("failed to read suite file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse suite file {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("unsupported suite format for {} (expected .toml, .json or .yaml)", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("no suite named '{name}' in {}", dir.display())]
    NotFound { name: String, dir: PathBuf },

    #[error("invalid suite '{suite}': {reason}")]
    Invalid { suite: String, reason: String },
}

fn is_suite_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("toml" | "json" | "yaml" | "yml")
    )
}

/// Parse suite text in the given format (`toml`, `json`, `yaml` or `yml`).
pub fn parse_suite(text: &str, format: &str, path: &Path) -> Result<Suite, SuiteError> {
    let parsed = match format {
        "toml" => toml::from_str::<Suite>(text).map_err(|e| e.to_string()),
        "json" => serde_json::from_str::<Suite>(text).map_err(|e| e.to_string()),
        "yaml" | "yml" => serde_yaml::from_str::<Suite>(text).map_err(|e| e.to_string()),
        _ => return Err(SuiteError::UnsupportedFormat(path.to_path_buf())),
    };
    let mut suite = parsed.map_err(|reason| SuiteError::Parse {
        path: path.to_path_buf(),
        reason,
    })?;

    if suite.name.is_empty() {
        suite.name = suite
            .metadata
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unnamed".to_string());
    }
    // A threshold implies the metric is requested.
    for case in &mut suite.cases {
        let implied: Vec<String> = case.thresholds.keys().cloned().collect();
        case.metrics.extend(implied);
    }

    validate(&suite)?;
    Ok(suite)
}

/// Load a suite file.
pub fn load_suite(path: &Path) -> Result<Suite, SuiteError> {
    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|_| is_suite_file(path))
        .ok_or_else(|| SuiteError::UnsupportedFormat(path.to_path_buf()))?;
    let text = std::fs::read_to_string(path).map_err(|source| SuiteError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let suite = parse_suite(&text, format, path)?;
    debug!(path = %path.display(), suite = %suite.name, cases = suite.cases.len(), "loaded suite");
    Ok(suite)
}

/// Load every suite file in `dir`, sorted by path. Unreadable files are
/// logged and skipped.
pub fn load_dir(dir: &Path) -> Result<Vec<(PathBuf, Suite)>, SuiteError> {
    let entries = std::fs::read_dir(dir).map_err(|source| SuiteError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_suite_file(p))
        .collect();
    paths.sort();

    let mut suites = Vec::new();
    for path in paths {
        match load_suite(&path) {
            Ok(suite) => suites.push((path, suite)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping suite file"),
        }
    }
    Ok(suites)
}

/// Find a suite in `dir` by suite name or file stem.
pub fn find_by_name(dir: &Path, name: &str) -> Result<Suite, SuiteError> {
    load_dir(dir)?
        .into_iter()
        .find(|(path, suite)| {
            suite.name == name || path.file_stem().is_some_and(|stem| stem == name)
        })
        .map(|(_, suite)| suite)
        .ok_or_else(|| SuiteError::NotFound {
            name: name.to_string(),
            dir: dir.to_path_buf(),
        })
}

/// Structural checks that hold for any suite regardless of adapters.
pub fn validate(suite: &Suite) -> Result<(), SuiteError> {
    let invalid = |reason: String| SuiteError::Invalid {
        suite: suite.name.clone(),
        reason,
    };

    let mut seen = BTreeSet::new();
    for case in &suite.cases {
        if case.id.trim().is_empty() {
            return Err(invalid("test case with empty id".into()));
        }
        if !seen.insert(case.id.as_str()) {
            return Err(invalid(format!("duplicate test case id '{}'", case.id)));
        }
        if let Some((metric, t)) = case.thresholds.iter().find(|(_, t)| !(0.0..=1.0).contains(*t)) {
            return Err(invalid(format!(
                "threshold {t} for metric '{metric}' in '{}' is outside [0, 1]",
                case.id
            )));
        }
    }
    Ok(())
}
