//! Virtual-user load generation engine.
//!
//! A [`TestOrchestrator`] validates a [`TestConfig`](vuload_core::TestConfig),
//! drives a [`RampController`] that starts and retires virtual users, feeds
//! every iteration's sample into a shared aggregator and finally judges the
//! configured thresholds into a [`TestReport`].

pub mod error;
pub mod iteration;
pub mod orchestrator;
pub mod profile;
pub mod ramp;
pub mod report;
pub mod runner;

pub use error::{EngineError, EngineResult};
pub use iteration::{iteration_fn, FnIteration, Iteration, IterationContext, IterationResult};
pub use orchestrator::{RunState, StopReason, TestOrchestrator};
pub use profile::{RampProfile, StagePosition};
pub use ramp::{RampController, RampOutcome, RampStatus};
pub use report::{
    ReportFormat, TestReport, EXIT_CONFIG_ERROR, EXIT_PASSED, EXIT_RUNTIME_ERROR,
    EXIT_THRESHOLDS_FAILED,
};
pub use runner::{RunnerContext, VirtualUserHandle, VuState};
