//! Test orchestrator for running a load test end to end

use crate::error::{EngineError, EngineResult};
use crate::iteration::Iteration;
use crate::profile::RampProfile;
use crate::ramp::{RampController, RampStatus};
use crate::report::TestReport;
use crate::runner::{RunnerContext, VirtualUserHandle};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use vuload_core::{MetricsAggregator, TestConfig, Threshold, ThresholdResult, ThresholdSet};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    /// Profile ended; waiting for in-flight iterations
    Draining,
    Finished,
}

impl RunState {
    /// Cancellation skips `Draining` and goes straight to `Finished`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Draining)
                | (Self::Running, Self::Finished)
                | (Self::Draining, Self::Finished)
        )
    }
}

/// Why the run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    Cancelled,
    ThresholdAborted { metric: String, expression: String },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DurationElapsed => f.write_str("duration elapsed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::ThresholdAborted { metric, expression } => {
                write!(f, "threshold `{}: {}` failed with abort_on_fail", metric, expression)
            }
        }
    }
}

/// Runs one load test: ramp, drain, evaluate, report.
pub struct TestOrchestrator {
    config: TestConfig,
    thresholds: ThresholdSet,
    iteration: Arc<dyn Iteration>,
    cancel: CancellationToken,
    state_tx: watch::Sender<RunState>,
    status_tx: watch::Sender<RampStatus>,
}

impl TestOrchestrator {
    /// Validate `config` and compile its thresholds. Fails before any user starts.
    pub fn new(config: TestConfig, iteration: Arc<dyn Iteration>) -> EngineResult<Self> {
        config.validate()?;
        let thresholds = config.compile_thresholds()?;

        let (state_tx, _) = watch::channel(RunState::Idle);
        let (status_tx, _) = watch::channel(RampStatus::default());

        Ok(Self {
            config,
            thresholds,
            iteration,
            cancel: CancellationToken::new(),
            state_tx,
            status_tx,
        })
    }

    /// Add a threshold defined in code, e.g. with [`Threshold::from_fn`].
    #[must_use]
    pub fn with_threshold(mut self, threshold: Threshold) -> Self {
        self.thresholds.push(threshold);
        self
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Cancelling this token stops the run cooperatively.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state_rx(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    pub fn status_rx(&self) -> watch::Receiver<RampStatus> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: RunState) -> EngineResult<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.state_tx.send_replace(next);
        info!(from = ?current, to = ?next, "run state changed");
        Ok(())
    }

    /// Run the load test to completion or cancellation.
    pub async fn run(self) -> EngineResult<TestReport> {
        self.transition(RunState::Running)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let aggregator = Arc::new(MetricsAggregator::new());
        let profile = RampProfile::from_config(&self.config);
        let thresholds = Arc::new(self.thresholds.clone());

        info!(
            %run_id,
            name = %self.config.name,
            profile = %profile.description(),
            duration_ms = profile.total_duration().as_millis() as u64,
            think_time_ms = self.config.think_time.as_millis() as u64,
            thresholds = thresholds.len(),
            "starting load test"
        );

        let runner = RunnerContext {
            iteration: Arc::clone(&self.iteration),
            aggregator: Arc::clone(&aggregator),
            think_time: self.config.think_time,
        };
        let controller = RampController::new(
            profile.clone(),
            self.config.tick_interval,
            self.config.vu_cap(),
            runner,
            self.cancel.clone(),
        )
        .with_status_sender(self.status_tx.clone());

        let monitor_stop = CancellationToken::new();
        let monitor_task = tokio::spawn(monitor(
            Arc::clone(&aggregator),
            Arc::clone(&thresholds),
            self.config.progress_interval,
            self.config.tick_interval,
            self.cancel.clone(),
            monitor_stop.clone(),
            self.status_tx.subscribe(),
        ));

        let outcome = controller.run().await;
        monitor_stop.cancel();
        let aborted = monitor_task.await?;

        let stop_reason = match (aborted, outcome.cancelled) {
            (Some(result), _) => StopReason::ThresholdAborted {
                metric: result.metric,
                expression: result.expression,
            },
            (None, true) => StopReason::Cancelled,
            (None, false) => StopReason::DurationElapsed,
        };

        if outcome.cancelled {
            self.transition(RunState::Finished)?;
        } else {
            self.transition(RunState::Draining)?;
        }

        let draining = drain(outcome.handles, self.config.graceful_stop);
        tokio::pin!(draining);
        let forced_stops = if self.state() == RunState::Draining {
            tokio::select! {
                forced = &mut draining => forced,
                _ = self.cancel.cancelled() => {
                    self.transition(RunState::Finished)?;
                    draining.await
                }
            }
        } else {
            draining.await
        };

        if self.state() == RunState::Draining {
            self.transition(RunState::Finished)?;
        }

        let snapshot = aggregator.snapshot();
        let evaluation = thresholds.evaluate(&snapshot);
        let passed = evaluation.passed && !matches!(stop_reason, StopReason::ThresholdAborted { .. });

        for failure in evaluation.hard_failures() {
            warn!(
                metric = %failure.metric,
                expression = %failure.expression,
                observed = ?failure.observed,
                reason = ?failure.reason,
                "threshold failed"
            );
        }

        info!(
            %run_id,
            passed,
            stop_reason = %stop_reason,
            requests = snapshot.requests,
            failures = snapshot.failures,
            elapsed_ms = snapshot.elapsed.as_millis() as u64,
            "load test finished"
        );

        Ok(TestReport {
            run_id,
            name: self.config.name.clone(),
            profile: profile.description(),
            started_at,
            finished_at: Utc::now(),
            stop_reason,
            peak_vus: outcome.peak_vus,
            forced_stops,
            metrics: snapshot.summary(),
            thresholds: evaluation,
            passed,
        })
    }
}

/// Periodic progress logging plus `abort_on_fail` checks.
///
/// Returns the threshold that aborted the run, if any.
async fn monitor(
    aggregator: Arc<MetricsAggregator>,
    thresholds: Arc<ThresholdSet>,
    progress_interval: Duration,
    check_interval: Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
    status_rx: watch::Receiver<RampStatus>,
) -> Option<ThresholdResult> {
    let watch_aborts = thresholds.has_abort_on_fail();

    let mut progress = interval_at(Instant::now() + progress_interval, progress_interval);
    progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut checks = interval_at(Instant::now() + check_interval, check_interval);
    checks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => return None,

            _ = checks.tick(), if watch_aborts => {
                let snapshot = aggregator.snapshot();
                if let Some(result) = thresholds.first_abort(&snapshot) {
                    warn!(
                        metric = %result.metric,
                        expression = %result.expression,
                        observed = ?result.observed,
                        "abort_on_fail threshold failed; stopping run"
                    );
                    cancel.cancel();
                    return Some(result);
                }
            }

            _ = progress.tick() => {
                let snapshot = aggregator.snapshot();
                let status = *status_rx.borrow();
                info!(
                    elapsed_s = snapshot.elapsed.as_secs(),
                    stage = status.stage,
                    vus = status.active_vus,
                    target_vus = status.target_vus,
                    requests = snapshot.requests,
                    rps = snapshot.request_rate().unwrap_or(0.0),
                    error_rate = snapshot.error_rate().unwrap_or(0.0),
                    p95_ms = ?snapshot.latency_percentile(95.0).map(|d| d.as_secs_f64() * 1000.0),
                    "progress"
                );
            }
        }
    }
}

/// Wait up to `grace` for stopped users to finish, then abort the rest.
///
/// Returns the number of users that had to be aborted.
async fn drain(handles: Vec<VirtualUserHandle>, grace: Duration) -> usize {
    if handles.is_empty() {
        return 0;
    }

    let mut joins: Vec<_> = handles
        .into_iter()
        .map(VirtualUserHandle::into_join_handle)
        .collect();

    let joined = timeout(grace, join_all(joins.iter_mut())).await;
    match joined {
        Ok(results) => {
            for result in results {
                if let Err(err) = result {
                    warn!(error = %err, "virtual user task failed");
                }
            }
            0
        }
        Err(_) => {
            let remaining = joins.iter().filter(|join| !join.is_finished()).count();
            for join in &joins {
                join.abort();
            }
            warn!(
                remaining,
                grace_ms = grace.as_millis() as u64,
                "grace period expired; aborting in-flight iterations"
            );
            remaining
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(RunState::Idle.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Draining));
        assert!(RunState::Running.can_transition_to(RunState::Finished));
        assert!(RunState::Draining.can_transition_to(RunState::Finished));

        assert!(!RunState::Idle.can_transition_to(RunState::Finished));
        assert!(!RunState::Finished.can_transition_to(RunState::Running));
        assert!(!RunState::Draining.can_transition_to(RunState::Running));
    }

    #[test]
    fn test_stop_reason_display() {
        let reason = StopReason::ThresholdAborted {
            metric: "http_req_failed".to_string(),
            expression: "rate<0.1".to_string(),
        };
        assert_eq!(
            reason.to_string(),
            "threshold `http_req_failed: rate<0.1` failed with abort_on_fail"
        );
        assert_eq!(StopReason::Cancelled.to_string(), "cancelled");
    }
}
