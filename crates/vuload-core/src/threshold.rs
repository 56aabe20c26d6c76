//! Threshold expressions and their evaluation against a metrics snapshot.
//!
//! A threshold is written as `<aggregation> <op> <bound>` and attached to one
//! of the built-in metrics, for example `http_req_duration: p(95)<500` or
//! `http_req_failed: rate<0.01`. Durations are compared in milliseconds.

use crate::aggregator::MetricsSnapshot;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Metrics the engine produces and thresholds may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    /// Iteration request latency (trend, milliseconds)
    HttpReqDuration,
    /// Share of failed requests (rate)
    HttpReqFailed,
    /// Requests issued (counter)
    HttpReqs,
    /// Completed iterations (counter)
    Iterations,
    /// Share of passed checks (rate)
    Checks,
}

impl MetricName {
    pub const ALL: [MetricName; 5] = [
        Self::HttpReqDuration,
        Self::HttpReqFailed,
        Self::HttpReqs,
        Self::Iterations,
        Self::Checks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpReqDuration => "http_req_duration",
            Self::HttpReqFailed => "http_req_failed",
            Self::HttpReqs => "http_reqs",
            Self::Iterations => "iterations",
            Self::Checks => "checks",
        }
    }

    fn supports(&self, aggregation: Aggregation) -> bool {
        match self {
            Self::HttpReqDuration => matches!(
                aggregation,
                Aggregation::Avg
                    | Aggregation::Min
                    | Aggregation::Max
                    | Aggregation::Med
                    | Aggregation::Percentile(_)
            ),
            Self::HttpReqFailed | Self::Checks => matches!(aggregation, Aggregation::Rate),
            Self::HttpReqs | Self::Iterations => {
                matches!(aggregation, Aggregation::Count | Aggregation::Rate)
            }
        }
    }

    fn observe(&self, aggregation: Aggregation, snapshot: &MetricsSnapshot) -> Option<f64> {
        let ms = |d: Option<std::time::Duration>| d.map(|d| d.as_secs_f64() * 1000.0);
        match (self, aggregation) {
            (Self::HttpReqDuration, Aggregation::Avg) => ms(snapshot.latency_mean()),
            (Self::HttpReqDuration, Aggregation::Min) => ms(snapshot.latency_min()),
            (Self::HttpReqDuration, Aggregation::Max) => ms(snapshot.latency_max()),
            (Self::HttpReqDuration, Aggregation::Med) => ms(snapshot.latency_percentile(50.0)),
            (Self::HttpReqDuration, Aggregation::Percentile(p)) => {
                ms(snapshot.latency_percentile(p))
            }
            (Self::HttpReqFailed, Aggregation::Rate) => snapshot.error_rate(),
            (Self::Checks, Aggregation::Rate) => snapshot.checks_rate(),
            (Self::HttpReqs | Self::Iterations, Aggregation::Count) => {
                (snapshot.requests > 0).then_some(snapshot.requests as f64)
            }
            (Self::HttpReqs | Self::Iterations, Aggregation::Rate) => snapshot.request_rate(),
            _ => None,
        }
    }
}

impl FromStr for MetricName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| CoreError::UnknownMetric(s.to_string()))
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a metric is reduced to one number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in (0, 100]
    Percentile(f64),
    Rate,
    Count,
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "med" => Ok(Self::Med),
            "rate" => Ok(Self::Rate),
            "count" => Ok(Self::Count),
            _ => {
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation `{}`", s))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile `{}`", inner))?;
                if !(p > 0.0 && p <= 100.0) {
                    return Err(format!("percentile {} out of range (0, 100]", p));
                }
                Ok(Self::Percentile(p))
            }
        }
    }
}

/// Comparison operator between the observed value and the bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Self::Lt => observed < bound,
            Self::Le => observed <= bound,
            Self::Gt => observed > bound,
            Self::Ge => observed >= bound,
            Self::Eq => observed == bound,
            Self::Ne => observed != bound,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// Parsed `<aggregation> <op> <bound>` expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
}

impl FromStr for ThresholdExpr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op_start = s
            .find(&['<', '>', '=', '!'][..])
            .ok_or_else(|| "missing comparison operator".to_string())?;
        let (lhs, rest) = s.split_at(op_start);

        let (comparison, op_len) = if rest.starts_with("<=") {
            (Comparison::Le, 2)
        } else if rest.starts_with(">=") {
            (Comparison::Ge, 2)
        } else if rest.starts_with("==") {
            (Comparison::Eq, 2)
        } else if rest.starts_with("!=") {
            (Comparison::Ne, 2)
        } else if rest.starts_with('<') {
            (Comparison::Lt, 1)
        } else if rest.starts_with('>') {
            (Comparison::Gt, 1)
        } else {
            return Err(format!("invalid operator in `{}`", s));
        };

        let aggregation: Aggregation = lhs.trim().parse()?;
        let rhs = rest[op_len..].trim();
        let bound: f64 = rhs
            .parse()
            .map_err(|_| format!("invalid bound `{}`", rhs))?;
        if !bound.is_finite() {
            return Err(format!("bound `{}` is not finite", rhs));
        }

        Ok(Self {
            aggregation,
            comparison,
            bound,
        })
    }
}

/// Threshold as written in configuration: a bare expression or a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expression(String),
    Detailed {
        threshold: String,
        /// Failing only warns; does not fail the run
        #[serde(default)]
        soft: bool,
        /// Failing during the run cancels it
        #[serde(default)]
        abort_on_fail: bool,
    },
}

impl ThresholdSpec {
    pub fn expression(&self) -> &str {
        match self {
            Self::Expression(expr) => expr,
            Self::Detailed { threshold, .. } => threshold,
        }
    }

    pub fn is_soft(&self) -> bool {
        matches!(self, Self::Detailed { soft: true, .. })
    }

    pub fn aborts_on_fail(&self) -> bool {
        matches!(self, Self::Detailed { abort_on_fail: true, .. })
    }
}

impl From<&str> for ThresholdSpec {
    fn from(expr: &str) -> Self {
        Self::Expression(expr.to_string())
    }
}

/// Pure function from a snapshot to the value a threshold checks.
pub type ObserveFn = Arc<dyn Fn(&MetricsSnapshot) -> Option<f64> + Send + Sync>;

#[derive(Clone)]
enum Observer {
    Builtin {
        metric: MetricName,
        aggregation: Aggregation,
    },
    Custom(ObserveFn),
}

/// One compiled pass/fail condition.
#[derive(Clone)]
pub struct Threshold {
    metric: String,
    expression: String,
    observer: Observer,
    comparison: Comparison,
    bound: f64,
    soft: bool,
    abort_on_fail: bool,
}

impl fmt::Debug for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Threshold")
            .field("metric", &self.metric)
            .field("expression", &self.expression)
            .field("soft", &self.soft)
            .field("abort_on_fail", &self.abort_on_fail)
            .finish()
    }
}

impl Threshold {
    /// Compile a configured threshold for a built-in metric.
    pub fn parse(metric: &str, spec: &ThresholdSpec) -> CoreResult<Self> {
        let metric_name: MetricName = metric.parse()?;
        let expression = spec.expression();
        let expr: ThresholdExpr = expression
            .parse()
            .map_err(|reason| CoreError::invalid_threshold(metric, expression, reason))?;

        if !metric_name.supports(expr.aggregation) {
            return Err(CoreError::invalid_threshold(
                metric,
                expression,
                format!("aggregation not supported by `{}`", metric_name),
            ));
        }

        Ok(Self {
            metric: metric.to_string(),
            expression: expression.to_string(),
            observer: Observer::Builtin {
                metric: metric_name,
                aggregation: expr.aggregation,
            },
            comparison: expr.comparison,
            bound: expr.bound,
            soft: spec.is_soft(),
            abort_on_fail: spec.aborts_on_fail(),
        })
    }

    /// Threshold over an arbitrary function of the snapshot.
    ///
    /// Returning `None` from `observe` means "no data" and fails the threshold.
    pub fn from_fn<F>(name: impl Into<String>, observe: F, comparison: Comparison, bound: f64) -> Self
    where
        F: Fn(&MetricsSnapshot) -> Option<f64> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            expression: format!("{}{}{}", name, comparison.as_str(), bound),
            metric: name,
            observer: Observer::Custom(Arc::new(observe)),
            comparison,
            bound,
            soft: false,
            abort_on_fail: false,
        }
    }

    #[must_use]
    pub fn soft(mut self) -> Self {
        self.soft = true;
        self
    }

    #[must_use]
    pub fn abort_on_fail(mut self) -> Self {
        self.abort_on_fail = true;
        self
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn is_soft(&self) -> bool {
        self.soft
    }

    pub fn aborts_on_fail(&self) -> bool {
        self.abort_on_fail
    }

    /// Value this threshold compares, `None` when the metric has no samples.
    pub fn observe(&self, snapshot: &MetricsSnapshot) -> Option<f64> {
        match &self.observer {
            Observer::Builtin {
                metric,
                aggregation,
            } => metric.observe(*aggregation, snapshot),
            Observer::Custom(observe) => observe(snapshot),
        }
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdResult {
        let observed = self.observe(snapshot);
        let (passed, reason) = match observed {
            None => (
                false,
                Some(format!("insufficient data: no samples for `{}`", self.metric)),
            ),
            Some(value) if self.comparison.holds(value, self.bound) => (true, None),
            Some(value) => (
                false,
                Some(format!(
                    "observed {:.4} does not satisfy {} {}",
                    value,
                    self.comparison.as_str(),
                    self.bound
                )),
            ),
        };

        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            observed,
            passed,
            soft: self.soft,
            abort_on_fail: self.abort_on_fail,
            reason,
        }
    }
}

/// Outcome of one threshold at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub passed: bool,
    pub soft: bool,
    pub abort_on_fail: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// All threshold results plus the overall verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdReport {
    pub results: Vec<ThresholdResult>,
    pub passed: bool,
}

impl ThresholdReport {
    /// Failed thresholds that decide the verdict.
    pub fn hard_failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| !r.passed && !r.soft)
    }

    /// Failed thresholds that only warn.
    pub fn soft_failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| !r.passed && r.soft)
    }
}

/// Ordered collection of thresholds.
///
/// Compiled thresholds are ordered by metric name, then by their position in
/// that metric's list; thresholds added with [`ThresholdSet::push`] follow in
/// insertion order. Results and reports keep this order.
#[derive(Debug, Clone, Default)]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every configured expression; the first malformed one aborts.
    ///
    /// Metrics are taken in name order, since configuration sources do not
    /// preserve key order across metrics.
    pub fn compile(specs: &BTreeMap<String, Vec<ThresholdSpec>>) -> CoreResult<Self> {
        let thresholds = specs
            .iter()
            .flat_map(|(metric, list)| list.iter().map(move |spec| Threshold::parse(metric, spec)))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self { thresholds })
    }

    pub fn push(&mut self, threshold: Threshold) {
        self.thresholds.push(threshold);
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.thresholds.iter()
    }

    pub fn has_abort_on_fail(&self) -> bool {
        self.thresholds.iter().any(Threshold::aborts_on_fail)
    }

    /// Judge every threshold; the verdict is the AND of the non-soft ones.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdReport {
        let results: Vec<ThresholdResult> = self
            .thresholds
            .iter()
            .map(|threshold| threshold.evaluate(snapshot))
            .collect();

        for result in &results {
            debug!(
                metric = %result.metric,
                expression = %result.expression,
                observed = ?result.observed,
                passed = result.passed,
                "threshold evaluated"
            );
            if !result.passed && result.soft {
                warn!(
                    metric = %result.metric,
                    expression = %result.expression,
                    observed = ?result.observed,
                    "soft threshold failed"
                );
            }
        }

        let passed = results.iter().all(|r| r.passed || r.soft);
        ThresholdReport { results, passed }
    }

    /// First `abort_on_fail` threshold that fails on actual data.
    ///
    /// Thresholds without samples yet are skipped so a run is not aborted
    /// before its first iteration completes.
    pub fn first_abort(&self, snapshot: &MetricsSnapshot) -> Option<ThresholdResult> {
        self.thresholds
            .iter()
            .filter(|threshold| threshold.aborts_on_fail())
            .map(|threshold| threshold.evaluate(snapshot))
            .find(|result| result.observed.is_some() && !result.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::MetricsAggregator;
    use crate::sample::{Outcome, Sample};
    use std::time::Duration;

    fn snapshot_with_failures(total: u64, failed: u64) -> MetricsSnapshot {
        let aggregator = MetricsAggregator::new();
        for i in 0..total {
            let status = if i < failed { 500 } else { 200 };
            aggregator.record(Sample::new(Outcome::Status(status), Duration::from_millis(20)));
        }
        aggregator.snapshot()
    }

    fn set(metric: &str, expr: &str) -> ThresholdSet {
        let mut specs = BTreeMap::new();
        specs.insert(metric.to_string(), vec![ThresholdSpec::from(expr)]);
        ThresholdSet::compile(&specs).unwrap()
    }

    #[test]
    fn test_parse_expressions() {
        let expr: ThresholdExpr = "p(95)<500".parse().unwrap();
        assert_eq!(expr.aggregation, Aggregation::Percentile(95.0));
        assert_eq!(expr.comparison, Comparison::Lt);
        assert_eq!(expr.bound, 500.0);

        let expr: ThresholdExpr = "rate <= 0.01".parse().unwrap();
        assert_eq!(expr.aggregation, Aggregation::Rate);
        assert_eq!(expr.comparison, Comparison::Le);

        let expr: ThresholdExpr = "p(99.9) >= 1".parse().unwrap();
        assert_eq!(expr.aggregation, Aggregation::Percentile(99.9));
        assert_eq!(expr.comparison, Comparison::Ge);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("p(95)".parse::<ThresholdExpr>().is_err());
        assert!("p(0)<1".parse::<ThresholdExpr>().is_err());
        assert!("p(101)<1".parse::<ThresholdExpr>().is_err());
        assert!("median<1".parse::<ThresholdExpr>().is_err());
        assert!("avg<fast".parse::<ThresholdExpr>().is_err());
        assert!("avg=<1".parse::<ThresholdExpr>().is_err());
    }

    #[test]
    fn test_compile_rejects_unknown_metric_and_mismatch() {
        let mut specs = BTreeMap::new();
        specs.insert("cpu_usage".to_string(), vec![ThresholdSpec::from("avg<1")]);
        assert!(matches!(
            ThresholdSet::compile(&specs),
            Err(CoreError::UnknownMetric(_))
        ));

        let mut specs = BTreeMap::new();
        specs.insert("http_req_failed".to_string(), vec![ThresholdSpec::from("p(95)<1")]);
        assert!(matches!(
            ThresholdSet::compile(&specs),
            Err(CoreError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_error_rate_threshold() {
        let thresholds = set("http_req_failed", "rate<0.01");

        let report = thresholds.evaluate(&snapshot_with_failures(100, 0));
        assert!(report.passed);
        assert_eq!(report.results[0].observed, Some(0.0));

        let report = thresholds.evaluate(&snapshot_with_failures(100, 2));
        assert!(!report.passed);
        assert_eq!(report.results[0].observed, Some(0.02));
        assert!(report.results[0].reason.is_some());
    }

    #[test]
    fn test_zero_samples_fail() {
        let thresholds = set("http_req_duration", "p(95)<500");
        let report = thresholds.evaluate(&MetricsAggregator::new().snapshot());

        assert!(!report.passed);
        assert_eq!(report.results[0].observed, None);
        assert!(report.results[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("insufficient data"));
    }

    #[test]
    fn test_soft_threshold_only_warns() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "http_req_duration".to_string(),
            vec![ThresholdSpec::Detailed {
                threshold: "p(95)<1".to_string(),
                soft: true,
                abort_on_fail: false,
            }],
        );
        specs.insert("http_req_failed".to_string(), vec![ThresholdSpec::from("rate<0.5")]);
        let thresholds = ThresholdSet::compile(&specs).unwrap();

        let report = thresholds.evaluate(&snapshot_with_failures(10, 0));
        assert!(report.passed);
        assert_eq!(report.soft_failures().count(), 1);
        assert_eq!(report.hard_failures().count(), 0);
    }

    #[test]
    fn test_custom_threshold() {
        let mut thresholds = ThresholdSet::new();
        thresholds.push(Threshold::from_fn(
            "status_500_count",
            |snapshot| Some(*snapshot.status_counts.get(&500).unwrap_or(&0) as f64),
            Comparison::Lt,
            3.0,
        ));

        assert!(thresholds.evaluate(&snapshot_with_failures(10, 2)).passed);
        assert!(!thresholds.evaluate(&snapshot_with_failures(10, 3)).passed);
    }

    #[test]
    fn test_first_abort_skips_empty_metrics() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "http_req_failed".to_string(),
            vec![ThresholdSpec::Detailed {
                threshold: "rate<0.1".to_string(),
                soft: false,
                abort_on_fail: true,
            }],
        );
        let thresholds = ThresholdSet::compile(&specs).unwrap();

        assert!(thresholds.first_abort(&MetricsAggregator::new().snapshot()).is_none());
        assert!(thresholds.first_abort(&snapshot_with_failures(10, 0)).is_none());
        assert!(thresholds.first_abort(&snapshot_with_failures(10, 5)).is_some());
    }

    #[test]
    fn test_result_order_is_stable() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "http_req_failed".to_string(),
            vec![ThresholdSpec::from("rate<0.5")],
        );
        specs.insert(
            "http_req_duration".to_string(),
            vec![ThresholdSpec::from("p(99)<1000"), ThresholdSpec::from("p(95)<500")],
        );
        specs.insert("checks".to_string(), vec![ThresholdSpec::from("rate>0.9")]);

        let mut set = ThresholdSet::compile(&specs).unwrap();
        set.push(Threshold::from_fn("custom", |_| Some(1.0), Comparison::Gt, 0.0));

        let report = set.evaluate(&snapshot_with_failures(10, 0));
        let order: Vec<(&str, &str)> = report
            .results
            .iter()
            .map(|r| (r.metric.as_str(), r.expression.as_str()))
            .collect();
        assert_eq!(order[0], ("checks", "rate>0.9"));
        assert_eq!(order[1], ("http_req_duration", "p(99)<1000"));
        assert_eq!(order[2], ("http_req_duration", "p(95)<500"));
        assert_eq!(order[3], ("http_req_failed", "rate<0.5"));
        assert_eq!(order[4].0, "custom");
    }

    #[test]
    fn test_counter_aggregations() {
        let snapshot = snapshot_with_failures(50, 0).with_elapsed(Duration::from_secs(10));
        assert!(set("http_reqs", "count>=50").evaluate(&snapshot).passed);
        assert!(set("iterations", "rate==5").evaluate(&snapshot).passed);
    }
}
