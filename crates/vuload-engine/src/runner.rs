//! Virtual user runner: one task per simulated user.

use crate::iteration::{Iteration, IterationContext, IterationResult};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vuload_core::{MetricsAggregator, Sample};

/// Lifecycle of one virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuState {
    Running,
    /// Stop requested; finishing the current iteration
    Stopping,
    Stopped,
}

/// Everything a virtual user needs to drive its loop.
#[derive(Clone)]
pub struct RunnerContext {
    pub iteration: Arc<dyn Iteration>,
    pub aggregator: Arc<MetricsAggregator>,
    pub think_time: Duration,
}

struct VirtualUser {
    id: u64,
    ctx: RunnerContext,
    stop: CancellationToken,
}

impl VirtualUser {
    /// Iterate until stopped; returns the number of completed iterations.
    async fn run(self) -> u64 {
        let mut completed = 0u64;

        while !self.stop.is_cancelled() {
            let ctx = IterationContext {
                vu_id: self.id,
                iteration: completed,
            };

            let started = Instant::now();
            let result = AssertUnwindSafe(self.ctx.iteration.run(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    warn!(vu = self.id, iteration = completed, "iteration panicked");
                    IterationResult::error("iteration panicked")
                });
            let latency = started.elapsed();

            self.ctx.aggregator.record(
                Sample::new(result.outcome, latency)
                    .with_checks(result.checks_passed, result.checks_failed),
            );
            completed += 1;

            if self.ctx.think_time.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => break,
                    _ = sleep(self.ctx.think_time) => {}
                }
            }
        }

        debug!(vu = self.id, iterations = completed, "virtual user stopped");
        completed
    }
}

/// Owning handle of a running virtual user.
///
/// Only the ramp controller creates and stops these.
pub struct VirtualUserHandle {
    id: u64,
    stop: CancellationToken,
    join: JoinHandle<u64>,
}

impl VirtualUserHandle {
    /// Start a virtual user whose stop signal is a child of `parent`.
    pub(crate) fn spawn(id: u64, ctx: RunnerContext, parent: &CancellationToken) -> Self {
        let stop = parent.child_token();
        let vu = VirtualUser {
            id,
            ctx,
            stop: stop.clone(),
        };
        let join = tokio::spawn(vu.run());
        Self { id, stop, join }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        if self.join.is_finished() {
            VuState::Stopped
        } else if self.stop.is_cancelled() {
            VuState::Stopping
        } else {
            VuState::Running
        }
    }

    /// Ask the user to stop after its current iteration.
    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub(crate) fn into_join_handle(self) -> JoinHandle<u64> {
        self.join
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::iteration_fn;

    fn context(iteration: Arc<dyn Iteration>, think_time: Duration) -> (RunnerContext, Arc<MetricsAggregator>) {
        let aggregator = Arc::new(MetricsAggregator::new());
        (
            RunnerContext {
                iteration,
                aggregator: Arc::clone(&aggregator),
                think_time,
            },
            aggregator,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_sample_per_iteration_and_think_time_excluded() {
        let iteration = Arc::new(iteration_fn(|_| async {
            sleep(Duration::from_millis(20)).await;
            IterationResult::status(200)
        }));
        let (ctx, aggregator) = context(iteration, Duration::from_millis(80));
        let root = CancellationToken::new();

        let handle = VirtualUserHandle::spawn(1, ctx, &root);
        sleep(Duration::from_millis(950)).await;
        handle.stop();
        let iterations = handle.into_join_handle().await.unwrap();

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.requests, iterations);
        assert_eq!(iterations, 10); // 100ms per iteration (20ms request + 80ms think)

        let max_ms = snapshot.latency_max().unwrap().as_secs_f64() * 1000.0;
        assert!(max_ms < 21.0, "latency includes think time: {}ms", max_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_loop() {
        let iteration = Arc::new(iteration_fn(|ctx: IterationContext| async move {
            sleep(Duration::from_millis(10)).await;
            if ctx.iteration % 2 == 0 {
                IterationResult::error("connection refused")
            } else {
                IterationResult::status(503)
            }
        }));
        let (ctx, aggregator) = context(iteration, Duration::ZERO);
        let root = CancellationToken::new();

        let handle = VirtualUserHandle::spawn(7, ctx, &root);
        sleep(Duration::from_millis(105)).await;
        root.cancel();
        let iterations = handle.into_join_handle().await.unwrap();

        let snapshot = aggregator.snapshot();
        assert_eq!(iterations, 11);
        assert_eq!(snapshot.failures, snapshot.requests);
        assert_eq!(snapshot.transport_errors, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_iteration() {
        let iteration = Arc::new(iteration_fn(|_| async {
            sleep(Duration::from_millis(500)).await;
            IterationResult::status(200)
        }));
        let (ctx, aggregator) = context(iteration, Duration::ZERO);
        let root = CancellationToken::new();

        let handle = VirtualUserHandle::spawn(1, ctx, &root);
        sleep(Duration::from_millis(100)).await;
        handle.stop();
        assert_eq!(handle.state(), VuState::Stopping);

        let iterations = handle.into_join_handle().await.unwrap();
        assert_eq!(iterations, 1);

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.failures, 0);
        // Full 500ms, within the histogram's 0.1% bucket error
        assert!(snapshot.latency_min().unwrap() >= Duration::from_micros(499_500));
        assert!(snapshot.latency_max().unwrap() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_iteration_is_an_error_sample() {
        let iteration = Arc::new(iteration_fn(|ctx: IterationContext| async move {
            sleep(Duration::from_millis(10)).await;
            if ctx.iteration == 0 {
                panic!("workload bug");
            }
            IterationResult::status(200)
        }));
        let (ctx, aggregator) = context(iteration, Duration::ZERO);
        let root = CancellationToken::new();

        let handle = VirtualUserHandle::spawn(1, ctx, &root);
        sleep(Duration::from_millis(35)).await;
        root.cancel();
        handle.into_join_handle().await.unwrap();

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.transport_errors, 1);
    }
}
