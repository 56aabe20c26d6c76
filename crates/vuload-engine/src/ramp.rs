//! Ramp controller
//!
//! Owns every [`VirtualUserHandle`] and, once per tick, reconciles the number
//! of running users with the profile target. Surplus users are retired newest
//! first and finish their current iteration before they stop.

use crate::profile::RampProfile;
use crate::runner::{RunnerContext, VirtualUserHandle};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vuload_core::metrics::ACTIVE_VUS;

/// Progress published after every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RampStatus {
    pub elapsed: Duration,
    pub stage: usize,
    pub target_vus: u32,
    pub active_vus: u32,
}

/// What the controller hands back when the profile ends or the run is cancelled.
pub struct RampOutcome {
    /// Users still running or retiring; all of them have been told to stop
    pub handles: Vec<VirtualUserHandle>,
    pub cancelled: bool,
    pub peak_vus: u32,
    pub elapsed: Duration,
}

pub struct RampController {
    profile: RampProfile,
    tick_interval: Duration,
    vu_cap: u32,
    runner: RunnerContext,
    cancel: CancellationToken,
    status_tx: watch::Sender<RampStatus>,
    active: Vec<VirtualUserHandle>,
    retiring: Vec<VirtualUserHandle>,
    next_id: u64,
    peak_vus: u32,
    cap_warned: bool,
}

impl RampController {
    /// `cancel` is the run-wide token; every user's stop token is its child.
    pub fn new(
        profile: RampProfile,
        tick_interval: Duration,
        vu_cap: u32,
        runner: RunnerContext,
        cancel: CancellationToken,
    ) -> Self {
        let (status_tx, _) = watch::channel(RampStatus::default());
        Self {
            profile,
            tick_interval,
            vu_cap,
            runner,
            cancel,
            status_tx,
            active: Vec::new(),
            retiring: Vec::new(),
            next_id: 1,
            peak_vus: 0,
            cap_warned: false,
        }
    }

    /// Publish status on an existing channel instead of the controller's own.
    #[must_use]
    pub fn with_status_sender(mut self, status_tx: watch::Sender<RampStatus>) -> Self {
        self.status_tx = status_tx;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<RampStatus> {
        self.status_tx.subscribe()
    }

    /// Drive the profile until its total duration elapses or the run is cancelled.
    pub async fn run(mut self) -> RampOutcome {
        let started = Instant::now();
        let deadline = started + self.profile.total_duration();

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            profile = %self.profile.description(),
            tick_ms = self.tick_interval.as_millis() as u64,
            vu_cap = self.vu_cap,
            "ramp controller started"
        );

        let expired = sleep_until(deadline);
        tokio::pin!(expired);

        let cancelled = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break true,
                _ = &mut expired => break false,
                _ = ticker.tick() => self.reconcile(started.elapsed()),
            }
        };

        let elapsed = started.elapsed();
        let mut handles = std::mem::take(&mut self.active);
        handles.append(&mut self.retiring);
        for handle in &handles {
            handle.stop();
        }
        ACTIVE_VUS.set(0);

        info!(
            cancelled,
            elapsed_ms = elapsed.as_millis() as u64,
            stopping = handles.len(),
            peak_vus = self.peak_vus,
            "ramp controller finished"
        );

        RampOutcome {
            handles,
            cancelled,
            peak_vus: self.peak_vus,
            elapsed,
        }
    }

    fn reconcile(&mut self, elapsed: Duration) {
        self.retiring.retain(|handle| !handle.is_finished());

        let position = self.profile.position_at(elapsed);
        let mut target = position.target_vus;
        if target > self.vu_cap {
            if !self.cap_warned {
                warn!(
                    requested = target,
                    cap = self.vu_cap,
                    "target exceeds max_vus; capping concurrency"
                );
                self.cap_warned = true;
            }
            target = self.vu_cap;
        }

        let current = self.active.len() as u32;
        if current < target {
            for _ in current..target {
                let id = self.next_id;
                self.next_id += 1;
                self.active
                    .push(VirtualUserHandle::spawn(id, self.runner.clone(), &self.cancel));
            }
        } else if current > target {
            for _ in target..current {
                if let Some(handle) = self.active.pop() {
                    handle.stop();
                    self.retiring.push(handle);
                }
            }
        }

        let active_vus = self.active.len() as u32;
        self.peak_vus = self.peak_vus.max(active_vus);
        ACTIVE_VUS.set(i64::from(active_vus));

        if current != active_vus {
            debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                stage = position.index,
                from = current,
                to = active_vus,
                retiring = self.retiring.len(),
                "reconciled virtual users"
            );
        }

        self.status_tx.send_replace(RampStatus {
            elapsed,
            stage: position.index,
            target_vus: target,
            active_vus,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::{iteration_fn, IterationContext, IterationResult};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::time::sleep;
    use vuload_core::{MetricsAggregator, RampStage};

    fn runner_context(iteration_ms: u64) -> (RunnerContext, Arc<MetricsAggregator>) {
        let aggregator = Arc::new(MetricsAggregator::new());
        let iteration = Arc::new(iteration_fn(move |_| async move {
            sleep(Duration::from_millis(iteration_ms)).await;
            IterationResult::status(200)
        }));
        (
            RunnerContext {
                iteration,
                aggregator: Arc::clone(&aggregator),
                think_time: Duration::ZERO,
            },
            aggregator,
        )
    }

    async fn drain(outcome: RampOutcome) {
        for handle in outcome.handles {
            handle.into_join_handle().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_converges_to_target() {
        let (runner, _) = runner_context(100);
        let profile = RampProfile::new(
            0,
            vec![RampStage::new(Duration::from_secs(10), 10), RampStage::new(Duration::from_secs(5), 10)],
        );
        let controller = RampController::new(profile, Duration::from_secs(1), 10, runner, CancellationToken::new());
        let status = controller.subscribe();
        let task = tokio::spawn(controller.run());

        sleep(Duration::from_millis(5_500)).await;
        let mid = *status.borrow();
        assert_eq!(mid.target_vus, 5);
        assert_eq!(mid.active_vus, 5);

        // Target reached by the tick at D; one tick of slack
        sleep(Duration::from_millis(5_000)).await;
        let end = *status.borrow();
        assert_eq!(end.stage, 1);
        assert_eq!(end.active_vus, 10);

        let outcome = task.await.unwrap();
        assert!(!outcome.cancelled);
        assert_eq!(outcome.peak_vus, 10);
        assert!(outcome.elapsed >= Duration::from_secs(15));
        assert!(outcome.elapsed < Duration::from_secs(16));
        drain(outcome).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_down_retires_newest_first() {
        let per_vu: Arc<Mutex<BTreeMap<u64, u64>>> = Arc::default();
        let counts = Arc::clone(&per_vu);
        let aggregator = Arc::new(MetricsAggregator::new());
        let runner = RunnerContext {
            iteration: Arc::new(iteration_fn(move |ctx: IterationContext| {
                let counts = Arc::clone(&counts);
                async move {
                    sleep(Duration::from_millis(100)).await;
                    *counts.lock().entry(ctx.vu_id).or_default() += 1;
                    IterationResult::status(200)
                }
            })),
            aggregator,
            think_time: Duration::ZERO,
        };

        let profile = RampProfile::new(
            4,
            vec![
                RampStage::new(Duration::from_secs(4), 4),
                RampStage::new(Duration::ZERO, 1),
                RampStage::new(Duration::from_secs(5), 1),
            ],
        );
        let controller = RampController::new(profile, Duration::from_secs(1), 4, runner, CancellationToken::new());
        let outcome = controller.run().await;
        drain(outcome).await;

        let counts = per_vu.lock();
        assert_eq!(counts.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        for retired in 2..=4 {
            assert!(counts[&1] > counts[&retired] + 40, "{:?}", *counts);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_capped_at_max_vus() {
        let (runner, _) = runner_context(50);
        let controller = RampController::new(
            RampProfile::constant(10, Duration::from_secs(3)),
            Duration::from_secs(1),
            3,
            runner,
            CancellationToken::new(),
        );
        let status = controller.subscribe();
        let task = tokio::spawn(controller.run());

        sleep(Duration::from_millis(1_500)).await;
        let current = *status.borrow();
        assert_eq!(current.target_vus, 3);
        assert_eq!(current.active_vus, 3);

        let outcome = task.await.unwrap();
        assert_eq!(outcome.peak_vus, 3);
        drain(outcome).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_target_idles_until_deadline() {
        let (runner, aggregator) = runner_context(10);
        let controller = RampController::new(
            RampProfile::constant(0, Duration::from_secs(5)),
            Duration::from_secs(1),
            0,
            runner,
            CancellationToken::new(),
        );

        let outcome = controller.run().await;
        assert!(!outcome.cancelled);
        assert!(outcome.handles.is_empty());
        assert!(outcome.elapsed >= Duration::from_secs(5));
        assert_eq!(aggregator.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_controller() {
        let (runner, _) = runner_context(100);
        let cancel = CancellationToken::new();
        let controller = RampController::new(
            RampProfile::constant(5, Duration::from_secs(60)),
            Duration::from_secs(1),
            5,
            runner,
            cancel.clone(),
        );
        let task = tokio::spawn(controller.run());

        sleep(Duration::from_secs(2)).await;
        cancel.cancel();

        let outcome = task.await.unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.elapsed < Duration::from_secs(3));
        assert_eq!(outcome.handles.len(), 5);
        drain(outcome).await;
    }
}
