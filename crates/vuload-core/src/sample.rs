//! Per-iteration samples produced by virtual users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of the request issued by one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The target answered with this status code.
    Status(u16),

    /// The request never produced a status (connect failure, timeout, ...).
    Error(String),
}

impl Outcome {
    /// Network errors and non-2xx statuses count as failed requests.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Status(code) => !(200..300).contains(code),
            Self::Error(_) => true,
        }
    }

    /// Status code, if the target answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(code) => Some(*code),
            Self::Error(_) => None,
        }
    }
}

/// One observed outcome of a single iteration.
///
/// Samples are immutable once built and handed to the aggregator by value, so
/// each one is counted exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    outcome: Outcome,
    latency: Duration,
    timestamp: DateTime<Utc>,
    checks_passed: u32,
    checks_failed: u32,
}

impl Sample {
    /// Build a sample stamped with the current wall-clock time.
    #[must_use]
    pub fn new(outcome: Outcome, latency: Duration) -> Self {
        Self {
            outcome,
            latency,
            timestamp: Utc::now(),
            checks_passed: 0,
            checks_failed: 0,
        }
    }

    /// Attach the pass/fail counts of the checks run against the response.
    #[must_use]
    pub fn with_checks(mut self, passed: u32, failed: u32) -> Self {
        self.checks_passed = passed;
        self.checks_failed = failed;
        self
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn checks_passed(&self) -> u32 {
        self.checks_passed
    }

    pub fn checks_failed(&self) -> u32 {
        self.checks_failed
    }

    pub fn is_failure(&self) -> bool {
        self.outcome.is_failure()
    }
}
