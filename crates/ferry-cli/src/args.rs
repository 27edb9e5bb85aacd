//! Command-line arguments.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use ferry_core::OrchestratorConfig;
use serde_json::{Map, Value};

use crate::error::CliError;
use crate::output::OutputFormat;

/// Ferry migration orchestrator
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(version, about = "Plan and run content platform migrations", long_about = None)]
pub struct Args {
    /// Output format
    #[arg(long, default_value = "table", value_enum, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List supported platforms.
    Platforms,

    /// Build a migration plan and print its steps.
    Plan(PlanArgs),

    /// Build a migration plan and run it with simulated step handlers.
    Run(RunArgs),
}

/// Platform pair, locations and builder options.
#[derive(ClapArgs, Debug)]
pub struct PlanArgs {
    /// Source platform (wordpress, drupal, ghost, ...).
    pub source: String,

    /// Destination platform.
    pub destination: String,

    /// Source location.
    #[arg(long = "from")]
    pub source_path: String,

    /// Destination location.
    #[arg(long = "to")]
    pub destination_path: String,

    /// Builder option as key=value, repeatable (e.g. create_backup=false).
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,
}

impl PlanArgs {
    /// Parse the `--option` flags into a builder option map.
    ///
    /// Values are read as JSON where possible, else kept as strings.
    pub fn option_map(&self) -> Result<Map<String, Value>, CliError> {
        let mut map = Map::new();
        for raw in &self.options {
            let (key, value) = raw
                .split_once('=')
                .ok_or_else(|| CliError::InvalidOption(raw.clone()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(CliError::InvalidOption(raw.clone()));
            }
            let value = serde_json::from_str(value.trim())
                .unwrap_or_else(|_| Value::String(value.trim().to_string()));
            map.insert(key.to_string(), value);
        }
        Ok(map)
    }
}

/// Arguments of `ferry run`.
#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// JSON configuration file. Flags below override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Steps of the plan running at the same time.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Handler attempts per step.
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// Delay between attempts in seconds.
    #[arg(long)]
    pub retry_delay: Option<u64>,

    /// Hard limit per step attempt in seconds. 0 disables it.
    #[arg(long)]
    pub step_timeout: Option<u64>,

    /// Simulated duration of every step in milliseconds.
    #[arg(long, default_value_t = 200)]
    pub step_delay_ms: u64,

    /// Print metrics in Prometheus text format when done.
    #[arg(long)]
    pub metrics: bool,
}

impl RunArgs {
    /// Build the orchestrator configuration: defaults, then the config
    /// file, then explicit flags.
    pub fn to_config(&self) -> Result<OrchestratorConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|source| CliError::ConfigFile {
                    path: path.clone(),
                    source,
                })?;
                OrchestratorConfig::from_json(&json)?
            }
            None => OrchestratorConfig::default(),
        };

        if let Some(limit) = self.max_concurrent {
            config = config.with_max_concurrent_steps(limit);
        }
        if let Some(attempts) = self.retry_attempts {
            config = config.with_retry_attempts(attempts);
        }
        if let Some(delay) = self.retry_delay {
            config = config.with_retry_delay(Duration::from_secs(delay));
        }
        match self.step_timeout {
            Some(0) => config = config.without_step_timeout(),
            Some(secs) => config = config.with_step_timeout(Duration::from_secs(secs)),
            None => {}
        }

        config.validate()?;
        Ok(config)
    }

    /// Simulated step duration.
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}
