//! Core data model: test cases, suites, per-test results and run records.
//!
//! Test cases and suites are read-only once loaded. A [`TestRun`] is mutated
//! only by the runner that owns it, and a [`TestResult`] is produced exactly
//! once per submitted test case.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Adapter selection: a registered type tag plus its opaque configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl AdapterSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: Map::new(),
        }
    }

    /// Set one configuration key.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }
}

/// A single declarative test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Unique within a suite; also the key for cross-run history.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_context: Option<Vec<String>>,
    /// Overrides the suite's default adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<AdapterSpec>,
    #[serde(default)]
    pub metrics: BTreeSet<String>,
    /// Minimum passing score per metric.
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Extra variables available to `{{token}}` substitution.
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl TestCase {
    pub fn new(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            input: input.into(),
            expected_output: None,
            retrieval_context: None,
            adapter: None,
            metrics: BTreeSet::new(),
            thresholds: BTreeMap::new(),
            tags: BTreeSet::new(),
            context: Map::new(),
            enabled: true,
            skip_reason: None,
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_adapter(mut self, adapter: AdapterSpec) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metrics.insert(metric.into());
        self
    }

    pub fn with_threshold(mut self, metric: impl Into<String>, min_score: f64) -> Self {
        let metric = metric.into();
        self.metrics.insert(metric.clone());
        self.thresholds.insert(metric, min_score);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// An ordered collection of test cases plus the adapter applied by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suite {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, alias = "llm_adapter", skip_serializing_if = "Option::is_none")]
    pub default_adapter: Option<AdapterSpec>,
    #[serde(default)]
    pub test_config: Map<String, Value>,
    #[serde(default, rename = "test_cases")]
    pub cases: Vec<TestCase>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Suite {
    pub fn new(name: impl Into<String>, cases: Vec<TestCase>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            metadata: Map::new(),
            default_adapter: None,
            test_config: Map::new(),
            cases,
        }
    }

    pub fn with_default_adapter(mut self, adapter: AdapterSpec) -> Self {
        self.default_adapter = Some(adapter);
        self
    }

    /// The adapter a case runs against: its own override, else the suite default.
    pub fn effective_adapter<'a>(&'a self, case: &'a TestCase) -> Option<&'a AdapterSpec> {
        case.adapter.as_ref().or(self.default_adapter.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Errored,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Errored => "errored",
            TestStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(TestStatus::Passed),
            "failed" => Ok(TestStatus::Failed),
            "errored" | "error" => Ok(TestStatus::Errored),
            "skipped" => Ok(TestStatus::Skipped),
            other => Err(format!("unknown test status '{other}'")),
        }
    }
}

/// Which stage produced an `errored` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Adapter,
    Evaluation,
    Cancelled,
    Internal,
}

/// Score for one metric of one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScore {
    pub score: f64,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of one test case within one run.
///
/// Every field is always populated: short-circuited executions carry an empty
/// `actual_output`, no metrics, and an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_case_id: String,
    pub status: TestStatus,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricScore>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    #[serde(default)]
    pub actual_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl TestResult {
    /// A result for a case that never started.
    pub fn skipped(test_case_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            status: TestStatus::Skipped,
            metrics: BTreeMap::new(),
            duration: Duration::ZERO,
            actual_output: String::new(),
            expected_output: None,
            error: Some(reason.into()),
            error_kind: None,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// A result for a case that failed before scores were obtained.
    pub fn errored(
        test_case_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            status: TestStatus::Errored,
            metrics: BTreeMap::new(),
            duration: Duration::ZERO,
            actual_output: String::new(),
            expected_output: None,
            error: Some(message.into()),
            error_kind: Some(kind),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(d)?;
        Duration::try_from_secs_f64(ms.max(0.0) / 1000.0).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Metadata and counters for one execution of a suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub suite_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub status: RunStatus,
    /// Set when at least one durable write failed during the run.
    #[serde(default)]
    pub persistence_degraded: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TestRun {
    pub fn new(id: impl Into<String>, suite_name: impl Into<String>, total: usize) -> Self {
        Self {
            id: id.into(),
            suite_name: suite_name.into(),
            started_at: Utc::now(),
            finished_at: None,
            total,
            passed: 0,
            failed: 0,
            errored: 0,
            skipped: 0,
            status: RunStatus::Running,
            persistence_degraded: false,
            metadata: Map::new(),
        }
    }

    /// Count one finalized result.
    pub fn record(&mut self, status: TestStatus) {
        match status {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Errored => self.errored += 1,
            TestStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn completed(&self) -> usize {
        self.passed + self.failed + self.errored + self.skipped
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }

    /// Percentage of all submitted cases that passed.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.passed as f64 / self.total as f64 * 100.0
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id.clone(),
            suite_name: self.suite_name.clone(),
            status: self.status,
            total: self.total,
            passed: self.passed,
            failed: self.failed,
            errored: self.errored,
            skipped: self.skipped,
            pass_rate: self.pass_rate(),
            duration_ms: self
                .finished_at
                .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64),
            persistence_degraded: self.persistence_degraded,
        }
    }
}

/// Final counters of a run, as carried by the `run_completed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub suite_name: String,
    pub status: RunStatus,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub pass_rate: f64,
    pub duration_ms: Option<u64>,
    pub persistence_degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_adapter_prefers_override() {
        let suite = Suite::new("s", vec![]).with_default_adapter(AdapterSpec::new("mock"));
        let plain = TestCase::new("a", "q");
        let custom = TestCase::new("b", "q").with_adapter(AdapterSpec::new("http"));

        assert_eq!(suite.effective_adapter(&plain).unwrap().kind, "mock");
        assert_eq!(suite.effective_adapter(&custom).unwrap().kind, "http");
    }

    #[test]
    fn test_run_counters_and_pass_rate() {
        let mut run = TestRun::new("r1", "suite", 4);
        run.record(TestStatus::Passed);
        run.record(TestStatus::Passed);
        run.record(TestStatus::Failed);
        run.record(TestStatus::Skipped);

        assert_eq!(run.completed(), 4);
        assert_eq!(run.pass_rate(), 50.0);
        assert!(!run.is_finished());

        run.finish(RunStatus::Completed);
        let summary = run.summary();
        assert_eq!(summary.status, RunStatus::Completed);
        assert!(summary.duration_ms.is_some());
    }

    #[test]
    fn test_status_parses_legacy_error_label() {
        assert_eq!("error".parse::<TestStatus>(), Ok(TestStatus::Errored));
        assert!("pending".parse::<TestStatus>().is_err());
    }

    #[test]
    fn test_result_serializes_duration_as_millis() {
        let mut result = TestResult::errored("tc", ErrorKind::Adapter, "boom");
        result.duration = Duration::from_millis(1500);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration_ms"], 1500.0);
        assert_eq!(json["status"], "errored");
        assert_eq!(json["error_kind"], "adapter");

        let back: TestResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1500));
    }

    #[test]
    fn test_case_defaults_when_deserialized() {
        let case: TestCase =
            serde_json::from_value(serde_json::json!({"id": "tc", "input": "hi"})).unwrap();
        assert!(case.enabled);
        assert!(case.metrics.is_empty());
        assert_eq!(case.display_name(), "tc");
    }
}
