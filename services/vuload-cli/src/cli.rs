//! Command-line surface of the `vuload` binary.

use crate::http::HttpIteration;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vuload_core::{parse_duration, CoreError, RampStage, TargetConfig, TestConfig};
use vuload_engine::{
    EngineError, ReportFormat, TestOrchestrator, TestReport, EXIT_CONFIG_ERROR, EXIT_PASSED,
    EXIT_RUNTIME_ERROR,
};

#[derive(Parser, Debug)]
#[command(name = "vuload")]
#[command(about = "Virtual-user load generator", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a load test
    Run(RunArgs),

    /// Check a configuration file without running it
    Validate {
        /// Configuration file (TOML, YAML or JSON)
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Target URL; overrides `target.url`
    #[arg(long)]
    pub url: Option<String>,

    /// Constant number of virtual users; replaces configured stages
    #[arg(long)]
    pub vus: Option<u32>,

    /// Test duration, e.g. `30s` or `1m30s`; replaces configured stages
    #[arg(long, value_parser = parse_duration_arg)]
    pub duration: Option<Duration>,

    /// Ramp stage as `DURATION:TARGET`, repeatable
    #[arg(long = "stage", value_parser = parse_stage)]
    pub stages: Vec<RampStage>,

    /// Pause between iterations of one virtual user
    #[arg(long, value_parser = parse_duration_arg)]
    pub think_time: Option<Duration>,

    /// Threshold as `METRIC=EXPRESSION`, repeatable
    #[arg(long = "threshold", value_parser = parse_threshold)]
    pub thresholds: Vec<(String, String)>,

    /// Write the report here instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Report format: json, jsonl or markdown
    #[arg(long, default_value = "json")]
    pub format: ReportFormat,

    /// Write the Prometheus text exposition here after the run
    #[arg(long)]
    pub prometheus_out: Option<PathBuf>,
}

impl RunArgs {
    /// Load the layered configuration, apply flags on top and validate.
    pub fn resolve_config(&self) -> Result<TestConfig, CoreError> {
        let mut config = TestConfig::load(self.config.as_deref())?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut TestConfig) {
        if let Some(url) = &self.url {
            match config.target.as_mut() {
                Some(target) => target.url = url.clone(),
                None => config.target = Some(TargetConfig::new(url.clone())),
            }
        }

        if self.vus.is_some() || self.duration.is_some() {
            config.stages.clear();
        }
        if let Some(vus) = self.vus {
            config.vus = vus;
        }
        if let Some(duration) = self.duration {
            config.duration = Some(duration);
        }
        if !self.stages.is_empty() {
            config.stages = self.stages.clone();
        }

        if let Some(think_time) = self.think_time {
            config.think_time = think_time;
        }

        for (metric, expression) in &self.thresholds {
            config
                .thresholds
                .entry(metric.clone())
                .or_default()
                .push(expression.as_str().into());
        }
    }
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn parse_stage(s: &str) -> Result<RampStage, String> {
    let (duration, target) = s
        .split_once(':')
        .ok_or_else(|| format!("stage `{}` must look like DURATION:TARGET", s))?;
    let target = target
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("stage target `{}`: {}", target, e))?;
    Ok(RampStage::new(parse_duration_arg(duration.trim())?, target))
}

fn parse_threshold(s: &str) -> Result<(String, String), String> {
    let (metric, expression) = s
        .split_once('=')
        .ok_or_else(|| format!("threshold `{}` must look like METRIC=EXPRESSION", s))?;
    Ok((metric.trim().to_string(), expression.trim().to_string()))
}

/// Two-phase interrupt handling: the first signal cancels the run and lets
/// in-flight iterations drain, the second asks for a hard exit.
///
/// Returns `true` only when a second signal arrived.
pub async fn watch_interrupts<F, Fut>(mut interrupted: F, cancel: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = interrupted().await {
        warn!(error = %err, "failed to listen for interrupts");
        return false;
    }
    warn!("interrupt received; stopping virtual users (press Ctrl-C again to abort)");
    cancel.cancel();

    match interrupted().await {
        Ok(()) => {
            warn!("second interrupt received; aborting immediately");
            true
        }
        Err(_) => false,
    }
}

/// Run a load test against the configured HTTP target and emit the report.
///
/// Ctrl-C cancels the run; the partial report is still produced. A second
/// Ctrl-C exits at once without waiting for the drain.
pub async fn execute(args: &RunArgs) -> anyhow::Result<TestReport> {
    let config = args.resolve_config()?;
    let target = config
        .target
        .clone()
        .ok_or_else(|| CoreError::invalid_config("no target configured; set `target.url` or pass --url"))?;

    let iteration = HttpIteration::new(&target)?;
    info!(url = %target.url, method = %target.method, "target configured");

    let orchestrator = TestOrchestrator::new(config, Arc::new(iteration))?;
    let cancel = orchestrator.cancel_token();
    let interrupt = tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, cancel).await {
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    });

    let report = orchestrator.run().await;
    interrupt.abort();
    let report = report?;

    match &args.out {
        Some(path) => {
            report
                .write_report(path, args.format)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            info!(path = %path.display(), format = %args.format, "report written");
        }
        None => println!("{}", report.render(args.format)?),
    }

    if let Some(path) = &args.prometheus_out {
        let text = vuload_core::metrics::export_text()?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }

    Ok(report)
}

/// `vuload run`: returns the process exit status.
pub async fn run(args: RunArgs) -> i32 {
    match execute(&args).await {
        Ok(report) => {
            if report.passed {
                info!("all thresholds passed");
            } else {
                warn!("thresholds failed");
            }
            report.exit_code()
        }
        Err(err) => {
            error!(error = %format!("{:#}", err), "load test failed");
            exit_code_for(&err)
        }
    }
}

/// `vuload validate`: returns the process exit status.
pub fn validate(path: &Path) -> i32 {
    let checked = TestConfig::load(Some(path)).and_then(|config| {
        config.validate()?;
        Ok(config)
    });

    match checked {
        Ok(config) => {
            info!(
                path = %path.display(),
                name = %config.name,
                duration_ms = config.total_duration().as_millis() as u64,
                peak_vus = config.peak_vus(),
                thresholds = config.thresholds.values().map(Vec::len).sum::<usize>(),
                "configuration is valid"
            );
            EXIT_PASSED
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "invalid configuration");
            EXIT_CONFIG_ERROR
        }
    }
}

/// Configuration problems exit with a dedicated status and produce no report.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    let config_error = err
        .downcast_ref::<CoreError>()
        .map(CoreError::is_config_error)
        .or_else(|| err.downcast_ref::<EngineError>().map(EngineError::is_config_error))
        .unwrap_or(false);

    if config_error {
        EXIT_CONFIG_ERROR
    } else {
        EXIT_RUNTIME_ERROR
    }
}
