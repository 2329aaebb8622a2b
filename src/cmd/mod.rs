//! Command-line interface and job execution.
//!
//! This module owns the outer run: environment loading, config rendering,
//! pipeline execution, and the operation-log row that every run leaves
//! behind, success or failure.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Local, NaiveDate};
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{dates, load_job_config, JobParameters};
use crate::errors::{DbtapError, Result};
use crate::log::{init_tracing_with, log_file_path};
use crate::oplog::{JobStatus, OperationLog, OperationLogRow};
use crate::pipeline::{ExecutedValues, Pipeline};
use crate::settings::Settings;
use crate::shell::ShellRunner;

/// Command-line interface structure for the dbtap extraction tool.
#[derive(Parser, Debug)]
#[command(
    name = "dbtap",
    version,
    about = "Extract from databases to numbered files, then ship them to blob storage.",
    long_about = "Extract from databases to numbered files, then ship them to blob storage.\n\n\
Resources:\n  • Job config: a JSON template with {{ name }} placeholders, one task per pipeline slot\n  • Environment: .env / .env.secret under /app_<project>/<project>/script/extraction/\n  • Execution: query → part files + control file → unzip/decrypt/key file → azcopy transfer"
)]
pub struct Cli {
    /// Project name selecting the environment root (mdp, oih).
    #[arg(long, default_value = "mdp")]
    pub project: String,

    /// Path to the job template.
    #[arg(long = "config_file_path", value_name = "FILE")]
    pub config_file_path: String,

    /// Calendar date of the data slice, YYYY-MM-DD.
    #[arg(long = "pos_dt", value_name = "DATE")]
    pub pos_dt: String,

    /// Workflow parent id, recorded in the operation log.
    #[arg(long = "adb_job_id", default_value = "")]
    pub adb_job_id: String,

    /// Workflow run id, recorded in the operation log.
    #[arg(long = "adb_run_id", default_value = "")]
    pub adb_run_id: String,

    /// Scheduler id, recorded in the operation log.
    #[arg(long = "scheduler_id", default_value = "")]
    pub scheduler_id: String,

    /// JSON overlay merged into the template; repeatable, applied in order.
    ///
    /// Example: --overwrite_config '{"tasks":{"source_data_extractor_task":{"parameters":{"allow_zero_record":true}}}}'
    #[arg(long = "overwrite_config", value_name = "JSON")]
    pub overwrite_config: Vec<String>,

    /// Comma-separated task-slot names; when set, only these slots run.
    #[arg(long = "run_only_task", value_name = "TASKS")]
    pub run_only_task: Option<String>,

    /// Enable verbose (debug) logging.
    #[arg(long)]
    pub verbose: bool,

    /// Emit logs in JSON format.
    #[arg(long = "log-json")]
    pub log_json: bool,

    /// Set log level (overrides env vars like RUST_LOG).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

fn environment_dir(project: &str) -> Result<String> {
    let root = match project {
        "mdp" => "app_mdp",
        "oih" => "app_oih",
        other => {
            return Err(DbtapError::ConfigInvalid(format!(
                "Unsupported project: {other}"
            )))
        }
    };
    Ok(format!("/{root}/{project}/script/extraction"))
}

/// Parse the run-only filter into an ordered set of slot names.
pub fn parse_run_only(raw: Option<&str>) -> Option<Vec<String>> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|slot| !slot.is_empty())
            .map(str::to_string)
            .collect()
    })
}

fn parse_overlays(raw: &[String]) -> Result<Vec<Value>> {
    raw.iter()
        .map(|overlay| {
            serde_json::from_str(overlay).map_err(|e| {
                DbtapError::ConfigInvalid(format!("invalid --overwrite_config JSON: {e}"))
            })
        })
        .collect()
}

/// Run one job end to end.
///
/// Config and environment failures surface before any side effect; once the
/// pipeline starts, an operation-log row is recorded for the run whatever
/// the outcome, and the first error is re-raised so the process exits
/// non-zero.
pub async fn run_job(cli: &Cli) -> Result<ExecutedValues> {
    let project = cli.project.to_lowercase();
    let env_dir = environment_dir(&project)?;
    // Missing env files are fine; named lookups fail later with a clear error
    let _ = dotenvy::from_path_override(format!("{env_dir}/.env"));
    let _ = dotenvy::from_path_override(format!("{env_dir}/.env.secret"));

    let mut settings = Settings::from_env();
    settings.project = project.clone();

    NaiveDate::parse_from_str(&cli.pos_dt, "%Y-%m-%d")?;

    let mut job_params = JobParameters {
        project,
        pos_dt: cli.pos_dt.clone(),
        config_file_path: cli.config_file_path.clone(),
        scheduler_id: cli.scheduler_id.clone(),
        adb_job_id: cli.adb_job_id.clone(),
        adb_run_id: cli.adb_run_id.clone(),
        run_only_task: parse_run_only(cli.run_only_task.as_deref()),
        ..Default::default()
    };

    let overlays = parse_overlays(&cli.overwrite_config)?;
    let config = load_job_config(
        &mut job_params,
        &overlays,
        &settings,
        Path::new(dates::HOLIDAY_DIR),
    )?;

    let log_path = log_file_path(
        Path::new(&settings.log_root()),
        &config.job_name,
        &job_params.pos_dt,
    )?;
    let level = cli
        .log_level
        .as_deref()
        .or(if cli.verbose { Some("debug") } else { None });
    init_tracing_with(level, cli.log_json, Some(log_path.as_path()))?;

    info!("═══════════════════════════════════════════════════════════");
    info!("🚀 Starting extraction job '{}'", config.job_name);
    info!("═══════════════════════════════════════════════════════════");
    info!("job parameters : {job_params:?}");

    let start_time = Instant::now();
    let job_start = Local::now();
    let mut pipeline = Pipeline::new(&config, &job_params, &settings, Arc::new(ShellRunner));
    let result = pipeline.execute().await;
    let job_end = Local::now();

    let (status, message) = match &result {
        Ok(()) => (JobStatus::Success, None),
        Err(err) => (JobStatus::Failed, Some(err.kind_and_text())),
    };

    let row = OperationLogRow::from_run(
        &job_params,
        job_start,
        job_end,
        status,
        message,
        &pipeline.executed_values,
    );
    info!("\n{}", row.summary_block());
    info!(
        "\n{divider}\nExtraction Control File Details\n{}\n{divider}",
        pipeline.executed_values.ctl_file_details.as_deref().unwrap_or(""),
        divider = "=".repeat(30),
    );

    // The log row must never mask the pipeline outcome
    let oplog = OperationLog::new(settings.oplog_root());
    if let Err(err) = oplog.append(&row) {
        warn!("failed to append operation log row: {err}");
    }
    if let Err(err) = oplog.housekeeping() {
        warn!("operation log housekeeping failed: {err}");
    }

    match result {
        Ok(()) => {
            info!(
                "✅ Job '{}' completed in {}ms",
                config.job_name,
                start_time.elapsed().as_millis()
            );
            Ok(pipeline.executed_values)
        }
        Err(err) => Err(err),
    }
}
