//! Test configuration
//!
//! A [`TestConfig`] is assembled once from layered sources and never mutated
//! afterwards:
//! - Hardcoded defaults (lowest priority)
//! - Config file (TOML, YAML or JSON), given explicitly or via `VULOAD_CONFIG`
//! - Environment variables with the `VULOAD_` prefix (highest priority)
//!
//! Callers apply any CLI overrides and then call [`TestConfig::validate`].

use crate::error::{CoreError, CoreResult};
use crate::threshold::{ThresholdSet, ThresholdSpec};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Root configuration of one load test.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestConfig {
    /// Scenario name used in logs and reports
    #[serde(default = "default_name")]
    pub name: String,

    /// Constant number of virtual users (ignored when `stages` is set)
    #[serde(default = "default_vus")]
    pub vus: u32,

    /// Test duration for the constant profile
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,

    /// Ramp stages, executed in order
    #[serde(default)]
    pub stages: Vec<RampStage>,

    /// Virtual users running when the first stage starts
    #[serde(default)]
    pub start_vus: u32,

    /// Hard cap on concurrently running virtual users
    #[serde(default)]
    pub max_vus: Option<u32>,

    /// Pause between two iterations of the same virtual user
    #[serde(default, with = "humantime_serde")]
    pub think_time: Duration,

    /// How often the ramp controller re-evaluates the target count
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// How long in-flight iterations may run after the test ends
    #[serde(default = "default_graceful_stop", with = "humantime_serde")]
    pub graceful_stop: Duration,

    /// Interval between progress log lines
    #[serde(default = "default_progress_interval", with = "humantime_serde")]
    pub progress_interval: Duration,

    /// Pass/fail conditions keyed by metric name
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdSpec>>,

    /// HTTP target used by the command-line runner
    #[serde(default)]
    pub target: Option<TargetConfig>,
}

/// One step of the ramp profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RampStage {
    /// Time to reach `target` from the previous stage's count
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Virtual users at the end of the stage
    pub target: u32,
}

impl RampStage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Request issued by every iteration of the command-line runner.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub checks: CheckConfig,
}

/// Per-response checks counted into the `checks` metric.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckConfig {
    /// "status is N"
    #[serde(default = "default_expect_status")]
    pub expect_status: Option<u16>,

    /// "response time < D"
    #[serde(default, with = "humantime_serde")]
    pub max_response_time: Option<Duration>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            expect_status: default_expect_status(),
            max_response_time: None,
        }
    }
}

fn default_name() -> String {
    "vuload".to_string()
}

fn default_vus() -> u32 {
    1
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_graceful_stop() -> Duration {
    Duration::from_secs(30)
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_expect_status() -> Option<u16> {
    Some(200)
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            vus: default_vus(),
            duration: None,
            stages: Vec::new(),
            start_vus: 0,
            max_vus: None,
            think_time: Duration::ZERO,
            tick_interval: default_tick_interval(),
            graceful_stop: default_graceful_stop(),
            progress_interval: default_progress_interval(),
            thresholds: BTreeMap::new(),
            target: None,
        }
    }
}

impl TestConfig {
    /// Constant profile: `vus` users for `duration`.
    pub fn constant(vus: u32, duration: Duration) -> Self {
        Self {
            vus,
            duration: Some(duration),
            ..Default::default()
        }
    }

    /// Staged profile starting from `start_vus = 0`.
    pub fn staged(stages: Vec<RampStage>) -> Self {
        Self {
            stages,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    #[must_use]
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    #[must_use]
    pub fn with_graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.graceful_stop = graceful_stop;
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, metric: impl Into<String>, spec: impl Into<ThresholdSpec>) -> Self {
        self.thresholds
            .entry(metric.into())
            .or_default()
            .push(spec.into());
        self
    }

    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// Precedence, highest first:
    /// 1. Environment variables, e.g. `VULOAD_VUS=50`, `VULOAD_TARGET__URL=...`
    /// 2. `path`, or the file named by `VULOAD_CONFIG`
    /// 3. Hardcoded defaults
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut builder = Self::set_defaults(Config::builder())?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        } else if let Ok(config_path) = std::env::var("VULOAD_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("VULOAD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Parse configuration from an in-memory document.
    pub fn from_document(content: &str, format: FileFormat) -> CoreResult<Self> {
        let config = Self::set_defaults(Config::builder())?
            .add_source(File::from_str(content, format))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        builder
            .set_default("name", default_name())?
            .set_default("vus", i64::from(default_vus()))?
            .set_default("start_vus", 0)?
            .set_default("think_time", "0s")?
            .set_default("tick_interval", "1s")?
            .set_default("graceful_stop", "30s")?
            .set_default("progress_interval", "10s")
    }

    /// Check every invariant; errors here abort before any virtual user starts.
    pub fn validate(&self) -> CoreResult<()> {
        if self.stages.is_empty() && self.duration.is_none() {
            return Err(CoreError::invalid_config(
                "either `duration` or a non-empty `stages` list must be set",
            ));
        }

        if !self.stages.is_empty() && self.duration.is_some() {
            warn!("both `duration` and `stages` are set; `stages` take precedence");
        }

        if self.total_duration().is_zero() {
            return Err(CoreError::invalid_config("total test duration must be > 0"));
        }

        if self.tick_interval.is_zero() {
            return Err(CoreError::invalid_config("`tick_interval` must be > 0"));
        }

        if self.progress_interval.is_zero() {
            return Err(CoreError::invalid_config("`progress_interval` must be > 0"));
        }

        if let Some(target) = &self.target {
            target.validate()?;
        }

        self.compile_thresholds()?;
        Ok(())
    }

    /// Compile the configured threshold expressions.
    pub fn compile_thresholds(&self) -> CoreResult<ThresholdSet> {
        ThresholdSet::compile(&self.thresholds)
    }

    /// Stages to execute; a constant profile becomes a single flat stage.
    pub fn effective_stages(&self) -> Vec<RampStage> {
        if self.stages.is_empty() {
            vec![RampStage::new(self.duration.unwrap_or_default(), self.vus)]
        } else {
            self.stages.clone()
        }
    }

    /// Virtual users at time zero.
    pub fn initial_vus(&self) -> u32 {
        if self.stages.is_empty() {
            self.vus
        } else {
            self.start_vus
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.effective_stages().iter().map(|stage| stage.duration).sum()
    }

    /// Largest target the profile ever asks for.
    pub fn peak_vus(&self) -> u32 {
        self.effective_stages()
            .iter()
            .map(|stage| stage.target)
            .fold(self.initial_vus(), u32::max)
    }

    /// Concurrency ceiling: `max_vus` if set, otherwise the profile's peak.
    pub fn vu_cap(&self) -> u32 {
        self.max_vus.unwrap_or_else(|| self.peak_vus())
    }
}

impl TargetConfig {
    /// `GET url` with default timeout and checks.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            timeout: default_request_timeout(),
            checks: CheckConfig::default(),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(CoreError::invalid_config(format!(
                "target.url `{}` must start with http:// or https://",
                self.url
            )));
        }

        if self.method.is_empty() || !self.method.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CoreError::invalid_config(format!(
                "target.method `{}` is not a valid HTTP method",
                self.method
            )));
        }

        if self.timeout.is_zero() {
            return Err(CoreError::invalid_config("target.timeout must be > 0"));
        }

        Ok(())
    }
}
