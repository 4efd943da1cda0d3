//! Run summaries and exports (JSON document or HTML report).

use std::fmt::Write as _;
use std::str::FromStr;

use askama::Template;
use serde_json::{json, Value};

use crate::model::{RunSummary, TestResult, TestRun, TestStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Html,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "html" => Ok(ExportFormat::Html),
            other => Err(format!("unknown export format '{other}' (expected json or html)")),
        }
    }
}

/// Human-readable multi-line summary of a run.
pub fn format_summary(run: &TestRun) -> String {
    let summary = run.summary();
    let mut out = String::new();
    let _ = writeln!(out, "Run {} ({})", summary.run_id, summary.suite_name);
    let _ = writeln!(out, "  status:    {}", summary.status);
    let _ = writeln!(
        out,
        "  total: {}  passed: {}  failed: {}  errored: {}  skipped: {}",
        summary.total, summary.passed, summary.failed, summary.errored, summary.skipped
    );
    let _ = writeln!(out, "  pass rate: {:.1}%", summary.pass_rate);
    if let Some(ms) = summary.duration_ms {
        let _ = writeln!(out, "  duration:  {:.2}s", ms as f64 / 1000.0);
    }
    if summary.persistence_degraded {
        let _ = writeln!(out, "  WARNING: some results could not be persisted");
    }
    out
}

/// `{metadata, summary, results}` export document.
pub fn export_json(run: &TestRun, results: &[TestResult]) -> Value {
    json!({
        "metadata": run,
        "summary": run.summary(),
        "results": results,
    })
}

struct MetricCell {
    name: String,
    score: String,
    passed: bool,
}

struct ResultRow {
    test_case_id: String,
    status: String,
    duration_ms: String,
    metrics: Vec<MetricCell>,
    actual_output: String,
    error: Option<String>,
}

impl From<&TestResult> for ResultRow {
    fn from(result: &TestResult) -> Self {
        Self {
            test_case_id: result.test_case_id.clone(),
            status: result.status.to_string(),
            duration_ms: format!("{:.0}", result.duration.as_secs_f64() * 1000.0),
            metrics: result
                .metrics
                .iter()
                .map(|(name, m)| MetricCell {
                    name: name.clone(),
                    score: format!("{:.2}", m.score),
                    passed: m.passed,
                })
                .collect(),
            actual_output: result.actual_output.clone(),
            error: match result.status {
                TestStatus::Errored | TestStatus::Skipped => result.error.clone(),
                _ => None,
            },
        }
    }
}

#[derive(Template)]
#[template(path = "report.html")]
struct HtmlReport {
    summary: RunSummary,
    started_at: String,
    pass_rate: String,
    rows: Vec<ResultRow>,
}

/// Render the HTML report for a run.
pub fn export_html(run: &TestRun, results: &[TestResult]) -> Result<String, askama::Error> {
    let summary = run.summary();
    HtmlReport {
        pass_rate: format!("{:.1}", summary.pass_rate),
        started_at: run.started_at.to_rfc3339(),
        summary,
        rows: results.iter().map(ResultRow::from).collect(),
    }
    .render()
}

/// Render a run in `format`.
pub fn export(run: &TestRun, results: &[TestResult], format: ExportFormat) -> anyhow::Result<String> {
    Ok(match format {
        ExportFormat::Json => serde_json::to_string_pretty(&export_json(run, results))?,
        ExportFormat::Html => export_html(run, results)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorKind, MetricScore, RunStatus};

    fn sample() -> (TestRun, Vec<TestResult>) {
        let mut run = TestRun::new("run-1", "geo <suite>", 2);
        let mut passed = TestResult::skipped("tc_001", "");
        passed.status = TestStatus::Passed;
        passed.error = None;
        passed.actual_output = "Paris".into();
        passed.metrics.insert(
            "answer_relevancy".into(),
            MetricScore {
                score: 0.95,
                passed: true,
                threshold: Some(0.7),
                reason: None,
            },
        );
        let errored = TestResult::errored("tc_002", ErrorKind::Adapter, "timed out");
        run.record(TestStatus::Passed);
        run.record(TestStatus::Errored);
        run.finish(RunStatus::Completed);
        (run, vec![passed, errored])
    }

    #[test]
    fn test_summary_text() {
        let (run, _) = sample();
        let text = format_summary(&run);
        assert!(text.contains("pass rate: 50.0%"));
        assert!(text.contains("errored: 1"));
    }

    #[test]
    fn test_json_export_shape() {
        let (run, results) = sample();
        let doc = export_json(&run, &results);
        assert_eq!(doc["summary"]["passed"], 1);
        assert_eq!(doc["metadata"]["id"], "run-1");
        assert_eq!(doc["results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_html_export_escapes_and_lists_results() {
        let (run, results) = sample();
        let html = export_html(&run, &results).unwrap();
        assert!(html.contains("geo &lt;suite&gt;"));
        assert!(html.contains("answer_relevancy: 0.95"));
        assert!(html.contains("timed out"));
        assert_eq!("HTML".parse::<ExportFormat>(), Ok(ExportFormat::Html));
    }
}
