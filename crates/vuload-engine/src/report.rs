//! Report generation for load test results

use crate::error::EngineResult;
use crate::orchestrator::StopReason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;
use vuload_core::{CoreError, MetricsSummary, ThresholdReport};

/// Process exit status when every hard threshold passed.
pub const EXIT_PASSED: i32 = 0;
/// Generic runtime failure.
pub const EXIT_RUNTIME_ERROR: i32 = 1;
/// A hard threshold failed, or an `abort_on_fail` threshold stopped the run.
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;
/// Configuration was rejected; no report is produced.
pub const EXIT_CONFIG_ERROR: i32 = 104;

/// Report format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Json,
    /// One summary record followed by one record per threshold
    JsonLines,
    Markdown,
}

impl FromStr for ReportFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::JsonLines),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(CoreError::invalid_config(format!(
                "unknown report format `{}` (expected json, jsonl or markdown)",
                other
            ))),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::JsonLines => "jsonl",
            Self::Markdown => "markdown",
        })
    }
}

/// Final result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub run_id: Uuid,
    pub name: String,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stop_reason: StopReason,
    pub peak_vus: u32,
    /// Virtual users aborted after the grace period
    pub forced_stops: usize,
    pub metrics: MetricsSummary,
    pub thresholds: ThresholdReport,
    pub passed: bool,
}

impl TestReport {
    pub fn exit_code(&self) -> i32 {
        if self.passed {
            EXIT_PASSED
        } else {
            EXIT_THRESHOLDS_FAILED
        }
    }

    pub fn render(&self, format: ReportFormat) -> EngineResult<String> {
        match format {
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::JsonLines => self.generate_json_lines(),
            ReportFormat::Markdown => Ok(self.generate_markdown()),
        }
    }

    /// Write report to file
    pub fn write_report(&self, path: impl AsRef<Path>, format: ReportFormat) -> EngineResult<()> {
        std::fs::write(path, self.render(format)?)?;
        Ok(())
    }

    fn generate_json_lines(&self) -> EngineResult<String> {
        let summary = json!({
            "type": "summary",
            "run_id": self.run_id,
            "name": self.name,
            "profile": self.profile,
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "stop_reason": self.stop_reason,
            "peak_vus": self.peak_vus,
            "forced_stops": self.forced_stops,
            "metrics": self.metrics,
            "passed": self.passed,
        });

        let mut out = serde_json::to_string(&summary)?;
        out.push('\n');
        for result in &self.thresholds.results {
            let mut record = serde_json::to_value(result)?;
            if let Value::Object(fields) = &mut record {
                fields.insert("type".to_string(), Value::from("threshold"));
            }
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        Ok(out)
    }

    fn generate_markdown(&self) -> String {
        let status = if self.passed { "✅ PASSED" } else { "❌ FAILED" };
        let m = &self.metrics;
        let checks_total = m.checks_passed + m.checks_failed;

        let mut out = String::new();
        let _ = write!(
            out,
            r#"# Load Test Report: {}

**Status**: {}

- **Run ID**: {}
- **Profile**: {}
- **Stop Reason**: {}

---

## Summary

- **Duration**: {:.1} seconds
- **Peak VUs**: {}
- **Total Requests**: {}
- **Failed**: {}
- **Transport Errors**: {}
- **Error Rate**: {}
- **Throughput**: {}
- **Checks**: {}/{} passed

---

## Latency

| Stat | Latency |
|------|---------|
| Min | {} |
| Avg | {} |
| Med | {} |
| P90 | {} |
| P95 | {} |
| P99 | {} |
| Max | {} |

---

## Status Codes

"#,
            self.name,
            status,
            self.run_id,
            self.profile,
            self.stop_reason,
            m.duration_seconds,
            self.peak_vus,
            m.total_requests,
            m.failed_requests,
            m.transport_errors,
            m.error_rate
                .map(|r| format!("{:.4}%", r * 100.0))
                .unwrap_or_else(|| "-".to_string()),
            m.requests_per_second
                .map(|r| format!("{:.1} req/s", r))
                .unwrap_or_else(|| "-".to_string()),
            m.checks_passed,
            checks_total,
            fmt_ms(m.latency_ms.min),
            fmt_ms(m.latency_ms.mean),
            fmt_ms(m.latency_ms.p50),
            fmt_ms(m.latency_ms.p90),
            fmt_ms(m.latency_ms.p95),
            fmt_ms(m.latency_ms.p99),
            fmt_ms(m.latency_ms.max),
        );

        if m.status_counts.is_empty() {
            out.push_str("No responses recorded\n");
        } else {
            out.push_str("| Status | Count |\n|--------|-------|\n");
            for (status, count) in &m.status_counts {
                let _ = writeln!(out, "| {} | {} |", status, count);
            }
        }

        out.push_str("\n---\n\n## Thresholds\n\n");
        if self.thresholds.results.is_empty() {
            out.push_str("No thresholds configured\n");
        } else {
            out.push_str("| Metric | Threshold | Observed | Status |\n");
            out.push_str("|--------|-----------|----------|--------|\n");
            for result in &self.thresholds.results {
                let mark = match (result.passed, result.soft) {
                    (true, _) => "✅",
                    (false, true) => "⚠️ soft",
                    (false, false) => "❌",
                };
                let observed = result
                    .observed
                    .map(|v| format!("{:.3}", v))
                    .or_else(|| result.reason.clone())
                    .unwrap_or_else(|| "-".to_string());
                let _ = writeln!(
                    out,
                    "| {} | `{}` | {} | {} |",
                    result.metric, result.expression, observed, mark
                );
            }
        }

        let _ = write!(
            out,
            "\n---\n\n**Report Generated**: {}\n",
            self.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        out
    }
}

fn fmt_ms(value: Option<f64>) -> String {
    value
        .map(|ms| format!("{:.2}ms", ms))
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use vuload_core::{MetricsAggregator, Outcome, Sample, ThresholdSet, ThresholdSpec};

    fn report(failed: u64) -> TestReport {
        let aggregator = MetricsAggregator::new();
        for i in 0..100 {
            let status = if i < failed { 500 } else { 200 };
            aggregator.record(
                Sample::new(Outcome::Status(status), Duration::from_millis(20 + i)).with_checks(2, 0),
            );
        }
        let snapshot = aggregator.snapshot().with_elapsed(Duration::from_secs(10));

        let mut specs = BTreeMap::new();
        specs.insert("http_req_failed".to_string(), vec![ThresholdSpec::from("rate<0.01")]);
        specs.insert("http_req_duration".to_string(), vec![ThresholdSpec::from("p(95)<500")]);
        let thresholds = ThresholdSet::compile(&specs).unwrap().evaluate(&snapshot);

        let now = Utc::now();
        TestReport {
            run_id: Uuid::new_v4(),
            name: "smoke".to_string(),
            profile: "Constant 10 VUs for 10s".to_string(),
            started_at: now - chrono::Duration::seconds(10),
            finished_at: now,
            stop_reason: StopReason::DurationElapsed,
            peak_vus: 10,
            forced_stops: 0,
            metrics: snapshot.summary(),
            passed: thresholds.passed,
            thresholds,
        }
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(report(0).exit_code(), EXIT_PASSED);
        assert_eq!(report(2).exit_code(), EXIT_THRESHOLDS_FAILED);
    }

    #[test]
    fn test_json_report() {
        let rendered = report(0).render(ReportFormat::Json).unwrap();
        let value: Value = serde_json::from_str(&rendered).unwrap();

        assert_eq!(value["name"], "smoke");
        assert_eq!(value["passed"], true);
        assert_eq!(value["stop_reason"]["kind"], "duration_elapsed");
        assert_eq!(value["metrics"]["total_requests"], 100);
        assert_eq!(value["metrics"]["status_counts"]["200"], 100);
        assert_eq!(value["thresholds"]["results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_json_lines_report() {
        let rendered = report(2).render(ReportFormat::JsonLines).unwrap();
        let lines: Vec<Value> = rendered
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "summary");
        assert_eq!(lines[0]["passed"], false);
        assert!(lines[1..].iter().all(|line| line["type"] == "threshold"));

        let failed = lines
            .iter()
            .find(|line| line["metric"] == "http_req_failed")
            .unwrap();
        assert_eq!(failed["passed"], false);
    }

    #[test]
    fn test_markdown_report() {
        let rendered = report(2).render(ReportFormat::Markdown).unwrap();

        assert!(rendered.starts_with("# Load Test Report: smoke"));
        assert!(rendered.contains("❌ FAILED"));
        assert!(rendered.contains("| 500 | 2 |"));
        assert!(rendered.contains("| http_req_failed | `rate<0.01` | 0.020 | ❌ |"));
        assert!(rendered.contains("**Checks**: 200/200 passed"));
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        report(0).write_report(&path, ReportFormat::Json).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"passed\": true"));
    }

    #[test]
    fn test_report_format_parse() {
        assert_eq!("json".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert_eq!("JSONL".parse::<ReportFormat>().unwrap(), ReportFormat::JsonLines);
        assert_eq!("md".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert!("xml".parse::<ReportFormat>().is_err());
    }
}
