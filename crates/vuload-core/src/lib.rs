//! Core types for vuload: configuration, samples, metric aggregation and
//! threshold evaluation.

pub mod aggregator;
pub mod config;
pub mod duration;
pub mod error;
pub mod metrics;
pub mod sample;
pub mod threshold;

pub use aggregator::{LatencySummary, MetricsAggregator, MetricsSnapshot, MetricsSummary};
pub use config::{CheckConfig, RampStage, TargetConfig, TestConfig};
pub use duration::{format_duration, parse_duration};
pub use error::{CoreError, CoreResult};
pub use sample::{Outcome, Sample};
pub use threshold::{
    Aggregation, Comparison, MetricName, Threshold, ThresholdExpr, ThresholdReport, ThresholdResult,
    ThresholdSet, ThresholdSpec,
};
