use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::errors::Result;

/// Compute the human-log path for one job run.
///
/// Layout is `<root>/<YYYY-MM>/<job_name>/extraction_fw_<job>_<yyyymmdd>_<ts>.log`,
/// where `<yyyymmdd>` comes from `pos_dt` and `<ts>` from the wall clock, so
/// reruns of the same slice never clobber each other's logs.
pub fn log_file_path(root: &Path, job_name: &str, pos_dt: &str) -> Result<PathBuf> {
    let now = Local::now();
    let pos = NaiveDate::parse_from_str(pos_dt, "%Y-%m-%d")?;
    let dir = root.join(now.format("%Y-%m").to_string()).join(job_name);
    let file_name = format!(
        "extraction_fw_{}_{}_{}.log",
        job_name,
        pos.format("%Y%m%d"),
        now.format("%Y%m%d%H%M%S")
    );
    Ok(dir.join(file_name))
}

/// Initialize tracing with explicit configuration options.
///
/// # Arguments
///
/// * `level` - Optional log level string (e.g., "info", "debug").
///   If `None`, falls back to `RUST_LOG` environment variable or defaults to "info"
/// * `use_json` - If `true`, emits structured JSON logs on stdout
/// * `log_file` - Optional path for the on-disk human log; parent directories
///   are created as needed
pub fn init_tracing_with(
    level: Option<&str>,
    use_json: bool,
    log_file: Option<&Path>,
) -> Result<()> {
    // Allow explicit level override, else fall back to RUST_LOG / default
    let filter = match level {
        Some(lvl) => EnvFilter::new(lvl),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if use_json {
        let file_layer = match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = File::create(path)?;
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(false)
                        .with_writer(Arc::new(file)),
                )
            }
            None => None,
        };
        let subscriber = Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(file_layer)
            .with(ErrorLayer::default());

        // Ignored when a subscriber is already installed (tests)
        let _ = tracing::subscriber::set_global_default(subscriber);
    } else {
        let file_layer = match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = File::create(path)?;
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(false)
                        .with_writer(Arc::new(file)),
                )
            }
            None => None,
        };
        let subscriber = Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(file_layer)
            .with(ErrorLayer::default());

        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path_layout() {
        let path = log_file_path(Path::new("/var/log/fw"), "cust_daily", "2024-02-28").unwrap();
        let rendered = path.to_string_lossy();
        assert!(rendered.starts_with("/var/log/fw/"));
        assert!(rendered.contains("/cust_daily/"));
        assert!(rendered.contains("extraction_fw_cust_daily_20240228_"));
        assert!(rendered.ends_with(".log"));
    }

    #[test]
    fn test_log_file_path_rejects_bad_date() {
        assert!(log_file_path(Path::new("/tmp"), "j", "28-02-2024").is_err());
    }
}
