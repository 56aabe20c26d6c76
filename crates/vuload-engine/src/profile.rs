//! Ramp profiles: how many virtual users should be active at a given time.

use std::time::Duration;
use vuload_core::{format_duration, RampStage, TestConfig};

/// Piecewise-linear VU profile.
///
/// Each stage interpolates from the count reached at the end of the previous
/// stage (or `start_vus` for the first one) to its own `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampProfile {
    start_vus: u32,
    stages: Vec<RampStage>,
}

/// Where in the profile a point in time falls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePosition {
    /// Index of the active stage; equals the stage count once the profile ended
    pub index: usize,
    pub target_vus: u32,
}

impl RampProfile {
    pub fn new(start_vus: u32, stages: Vec<RampStage>) -> Self {
        Self { start_vus, stages }
    }

    /// Constant profile: `vus` for `duration`.
    pub fn constant(vus: u32, duration: Duration) -> Self {
        Self::new(vus, vec![RampStage::new(duration, vus)])
    }

    pub fn from_config(config: &TestConfig) -> Self {
        Self::new(config.initial_vus(), config.effective_stages())
    }

    pub fn stages(&self) -> &[RampStage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|stage| stage.duration).sum()
    }

    /// Target VU count at `elapsed` since the start of the run.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        self.position_at(elapsed).target_vus
    }

    /// Active stage and target VU count at `elapsed`.
    pub fn position_at(&self, elapsed: Duration) -> StagePosition {
        let mut from = self.start_vus;
        let mut stage_start = Duration::ZERO;

        for (index, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let delta = (f64::from(stage.target) - f64::from(from)) * progress;
                return StagePosition {
                    index,
                    target_vus: (f64::from(from) + delta) as u32,
                };
            }
            from = stage.target;
            stage_start = stage_end;
        }

        StagePosition {
            index: self.stages.len(),
            target_vus: from,
        }
    }

    /// Human readable summary used in logs and reports.
    pub fn description(&self) -> String {
        match self.stages.as_slice() {
            [] => format!("{} VUs, no stages", self.start_vus),
            [only] if only.target == self.start_vus => {
                format!("Constant {} VUs for {}", only.target, format_duration(only.duration))
            }
            stages => {
                let steps: Vec<String> = stages
                    .iter()
                    .map(|stage| format!("{} over {}", stage.target, format_duration(stage.duration)))
                    .collect();
                format!("Ramp from {} VUs: {}", self.start_vus, steps.join(" → "))
            }
        }
    }
}
