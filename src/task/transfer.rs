//! Cloud transfer via the azcopy CLI: pre-clean, copy with retry, verify
//! per-file success from the copier's JSON event stream.

use std::fs;
use std::path::Path;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{AuthMode, TransferLocation, TransferParams};
use crate::errors::{DbtapError, Result};
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::shell::CommandRunner;
use crate::task::FileDescriptor;

const AZCOPY_CAP_MBPS: u32 = 150;

/// Destination URL pair: `display` never carries the credential and is the
/// only form that reaches logs and the operation record.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetUrl {
    pub display: String,
    pub with_credential: String,
}

pub fn build_target_url(
    account_name: &str,
    container_name: &str,
    filepath: &str,
    sas_token: &str,
    auth_mode: AuthMode,
) -> TargetUrl {
    let display = format!("https://{account_name}.blob.core.windows.net/{container_name}/{filepath}");
    let with_credential = match auth_mode {
        AuthMode::Sas if !sas_token.is_empty() => format!("{display}?{sas_token}"),
        _ => display.clone(),
    };
    TargetUrl {
        display,
        with_credential,
    }
}

/// Copier summary totals, folded over the whole event stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopySummary {
    pub total: Option<i64>,
    pub completed: Option<i64>,
    pub failed: Option<i64>,
    pub job_status: Option<String>,
}

fn get_ci<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn get_int(map: &Map<String, Value>, key: &str) -> Option<i64> {
    match get_ci(map, key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Parse the newline-delimited JSON event stream from the copier.
///
/// Only `Progress` and `EndOfJob` events carry the counters; their
/// `MessageContent` is itself JSON, usually as a string. Field-name casing
/// varies across copier versions, so every lookup is case-insensitive and
/// unparseable lines are skipped.
pub fn parse_copier_stream(stdout: &str) -> CopySummary {
    let mut summary = CopySummary::default();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(Value::Object(event)) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        let is_summary_event = get_ci(&event, "MessageType")
            .and_then(Value::as_str)
            .map(|t| t.eq_ignore_ascii_case("Progress") || t.eq_ignore_ascii_case("EndOfJob"))
            .unwrap_or(false);
        if !is_summary_event {
            continue;
        }

        let inner = match get_ci(&event, "MessageContent") {
            Some(Value::String(content)) => match serde_json::from_str::<Value>(content) {
                Ok(Value::Object(inner)) => inner,
                _ => continue,
            },
            Some(Value::Object(inner)) => inner.clone(),
            _ => continue,
        };

        if let Some(total) = get_int(&inner, "TotalTransfers") {
            summary.total = Some(total);
        }
        if let Some(completed) = get_int(&inner, "TransfersCompleted") {
            summary.completed = Some(completed);
        }
        if let Some(failed) = get_int(&inner, "TransfersFailed") {
            summary.failed = Some(failed);
        }
        if let Some(status) = get_ci(&inner, "JobStatus").and_then(Value::as_str) {
            summary.job_status = Some(status.to_string());
        }
    }

    summary
}

/// Expand one source entry into the planned local paths: a glob pattern, a
/// directory, a single file, or a remote URL passed through untouched.
pub fn expand_source(location: &str) -> Result<Vec<String>> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(vec![location.to_string()]);
    }
    if location.chars().any(|c| matches!(c, '*' | '?' | '[' | ']')) {
        let mut files = Vec::new();
        for entry in glob::glob(location)? {
            let path = entry?;
            if path.is_file() {
                files.push(path.to_string_lossy().into_owned());
            }
        }
        files.sort();
        if files.is_empty() {
            info!(
                "Source pattern '{location}' matched 0 local files; calling the copier anyway \
                 and accepting 0 transfers."
            );
        }
        return Ok(files);
    }

    let path = Path::new(location);
    if path.is_dir() {
        let mut files = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path().to_string_lossy().into_owned());
            }
        }
        files.sort();
        Ok(files)
    } else {
        // A file, or a remote URL / missing path for the copier to judge
        Ok(vec![location.to_string()])
    }
}

/// Fail fast when a planned local file is missing.
pub fn check_planned_exist(planned: &[String]) -> Result<()> {
    if planned.iter().any(|f| f.starts_with("http")) {
        return Ok(());
    }
    let missing: Vec<&String> = planned
        .iter()
        .filter(|f| !Path::new(f).exists())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DbtapError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Planned source files not found: {missing:?}"),
        )))
    }
}

/// The per-attempt decision table over the copier summary.
pub fn decide_outcome(summary: &CopySummary, planned: Vec<String>) -> Result<Vec<String>> {
    if summary.total == Some(0) {
        info!("Copier reported TotalTransfers=0; treating as successful no-op.");
        return Ok(Vec::new());
    }

    if let Some(failed) = summary.failed {
        if failed > 0 {
            return Err(DbtapError::CopyTransient(format!(
                "AzCopy reported failed transfers: TransfersFailed={failed} / TotalTransfers={}",
                summary
                    .total
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )));
        }
    }

    if let (Some(completed), Some(total)) = (summary.completed, summary.total) {
        if completed != total {
            warn!(
                "AzCopy TransfersCompleted ({completed}) != TotalTransfers ({total}). \
                 Returning planned source files; check logs if this is unexpected."
            );
        }
    }

    Ok(planned)
}

fn strip_credential(location: &str) -> &str {
    location.split('?').next().unwrap_or(location)
}

fn basename(location: &str) -> String {
    Path::new(strip_credential(location))
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Include-pattern for the destination pre-clean, derived from the source
/// file name with its part-number slot widened to `*`.
///
/// Stale siblings from a wider earlier run differ only in their part
/// number, so the pattern must match every part, not just the one about to
/// be copied. An unrendered `{{ part_number }}` token widens the same way;
/// names without a part slot (ctl, key files) stay literal.
pub fn cleanup_include_pattern(file_name: &str) -> Result<String> {
    let token = Regex::new(r"\{\{\s*part_number\s*\}\}")?;
    if token.is_match(file_name) {
        return Ok(token.replace_all(file_name, "*").into_owned());
    }
    let part_slot = Regex::new(r"-\d+(\.[^.]*)?$")?;
    Ok(part_slot.replace(file_name, "-*$1").into_owned())
}

async fn cleanup_destination(
    params: &TransferParams,
    target: &TargetUrl,
    include_pattern: &str,
    runner: &dyn CommandRunner,
    policy: &RetryPolicy,
) -> Result<()> {
    let cleanup_url = match params.auth_mode {
        AuthMode::Sas => target.with_credential.clone(),
        AuthMode::ServicePrincipal => target.display.clone(),
    };
    info!(
        "Cleanup command: azcopy rm '{}' --include-pattern '{include_pattern}'",
        target.display
    );

    retry_with_policy(policy, "Azcopy file cleanup", |retry| {
        let mut args = vec![
            "rm".to_string(),
            cleanup_url.clone(),
            "--include-pattern".to_string(),
            include_pattern.to_string(),
        ];
        args.extend(params.cleanup_options.clone());
        async move {
            info!("Start Azcopy file cleanup. Retry count: {retry}");
            let result = runner
                .run(
                    "azcopy",
                    &args,
                    &[("AZCOPY_DISABLE_SYSLOG".to_string(), "true".to_string())],
                )
                .await?;
            if !result.success() {
                return Err(DbtapError::CopyTransient(format!(
                    "Azcopy cleanup returned with exit_code: {}.\nRetry count: {retry}\nError_message: \n{}",
                    result.exit_code, result.stderr
                )));
            }
            debug!("Output from the azcopy cleanup command: \n{}", result.stdout);
            Ok(())
        }
    })
    .await
}

async fn copy_source(
    params: &TransferParams,
    source: &str,
    target_with_credential: &str,
    runner: &dyn CommandRunner,
    policy: &RetryPolicy,
) -> Result<Vec<String>> {
    retry_with_policy(policy, "AzCopy file transfer", |retry| {
        let source = source.to_string();
        let target = target_with_credential.to_string();
        async move {
            info!("Start AzCopy file transfer. Retry count: {retry}");

            let planned = expand_source(&source)?;
            debug!("Planned files to transfer ({}): {planned:?}", planned.len());
            check_planned_exist(&planned)?;

            let mut args = vec![params.azcopy_command.clone(), source.clone(), target];
            args.extend(params.azcopy_options.clone());
            args.push(format!("--cap-mbps={AZCOPY_CAP_MBPS}"));
            args.push("--output-type=json".to_string());

            let result = runner
                .run(
                    "azcopy",
                    &args,
                    &[("AZCOPY_DISABLE_SYSLOG".to_string(), "true".to_string())],
                )
                .await?;

            if !result.success() {
                let no_such_file = result.stderr.contains("no such file or directory")
                    || result.stdout.contains("no such file or directory");
                if params.allow_zero_file && no_such_file {
                    info!("Copier found no source files; allow_zero_file accepts this as success.");
                    return Ok(Vec::new());
                }
                return Err(DbtapError::CopyTransient(format!(
                    "Azcopy command returned with exit_code: {}.\nRetry count: {retry}\nOutput: \n{}\nError_message: \n{}",
                    result.exit_code, result.stdout, result.stderr
                )));
            }

            let summary = parse_copier_stream(&result.stdout);
            info!(
                "AzCopy summary: JobStatus={:?}, TotalTransfers={:?}, TransfersCompleted={:?}, TransfersFailed={:?}",
                summary.job_status, summary.total, summary.completed, summary.failed
            );
            decide_outcome(&summary, planned)
        }
    })
    .await
}

fn cleanup_sources(transferred: &[String]) -> Result<()> {
    for file in transferred {
        let path = Path::new(file);
        if path.is_file() {
            fs::remove_file(path)?;
            info!("Cleaned up source file: {file}");
        }
    }
    Ok(())
}

/// Transfer the file set and return the credential-stripped destination URL.
pub async fn run(
    params: &TransferParams,
    files: Option<&[FileDescriptor]>,
    runner: &dyn CommandRunner,
) -> Result<String> {
    run_with_policy(params, files, runner, &RetryPolicy::transfer()).await
}

/// [`run`] with an explicit retry envelope, shared by the copy and the
/// destination cleanup.
pub async fn run_with_policy(
    params: &TransferParams,
    files: Option<&[FileDescriptor]>,
    runner: &dyn CommandRunner,
    policy: &RetryPolicy,
) -> Result<String> {
    let sources: Vec<String> = if let Some(source) = &params.source {
        vec![match source {
            TransferLocation::LocalLocation { filepath } => filepath.clone(),
            TransferLocation::AdlsLocation {
                account_name,
                container_name,
                sas_token,
                filepath,
            } => {
                build_target_url(
                    account_name,
                    container_name,
                    filepath,
                    sas_token,
                    params.auth_mode,
                )
                .with_credential
            }
        }]
    } else if let Some(list) = files.filter(|list| !list.is_empty()) {
        list.iter().map(|f| f.location.clone()).collect()
    } else {
        return Err(DbtapError::ConfigInvalid(
            "Please input Source parameter in config".to_string(),
        ));
    };

    let target = match &params.target {
        TransferLocation::AdlsLocation {
            account_name,
            container_name,
            sas_token,
            filepath,
        } => build_target_url(
            account_name,
            container_name,
            filepath,
            sas_token,
            params.auth_mode,
        ),
        TransferLocation::LocalLocation { filepath } => TargetUrl {
            display: filepath.clone(),
            with_credential: filepath.clone(),
        },
    };

    // Pre-clean runs once per distinct pattern, before any copy: the
    // widened pattern matches every part number, so cleaning inside the
    // copy loop would delete parts uploaded earlier in this same run.
    if params.cleanup_dest_flag {
        if let TransferLocation::AdlsLocation { .. } = &params.target {
            let mut patterns = std::collections::BTreeSet::new();
            for source in &sources {
                patterns.insert(cleanup_include_pattern(&basename(source))?);
            }
            for pattern in patterns {
                cleanup_destination(params, &target, &pattern, runner, policy).await?;
                info!("Cleaned up file with pattern: {pattern} completed.");
            }
        }
    }

    for source in &sources {
        info!("Performing transfer on source: {}", strip_credential(source));

        let transferred =
            copy_source(params, source, &target.with_credential, runner, policy).await?;

        if params.cleanup_source_flag {
            cleanup_sources(&transferred)?;
        }
    }

    Ok(target.display)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_target_url_strips_credential_from_display() {
        let target = build_target_url("acct", "inbound", "landing/cust", "sv=2024&sig=x", AuthMode::Sas);
        assert_eq!(
            target.display,
            "https://acct.blob.core.windows.net/inbound/landing/cust"
        );
        assert!(target.with_credential.ends_with("?sv=2024&sig=x"));
    }

    #[test]
    fn test_service_principal_url_has_no_token() {
        let target = build_target_url("acct", "inbound", "p", "sv=1", AuthMode::ServicePrincipal);
        assert_eq!(target.display, target.with_credential);
    }

    #[test]
    fn test_parse_copier_stream_nested_content() {
        let stdout = concat!(
            "{\"MessageType\": \"Init\", \"MessageContent\": \"{}\"}\n",
            "not json at all\n",
            "{\"MessageType\": \"Progress\", \"MessageContent\": \"{\\\"TotalTransfers\\\": 3, \\\"TransfersCompleted\\\": 1, \\\"TransfersFailed\\\": 0}\"}\n",
            "{\"MessageType\": \"EndOfJob\", \"MessageContent\": \"{\\\"TotalTransfers\\\": 3, \\\"TransfersCompleted\\\": 3, \\\"TransfersFailed\\\": 0, \\\"JobStatus\\\": \\\"Completed\\\"}\"}\n",
        );
        let summary = parse_copier_stream(stdout);
        assert_eq!(summary.total, Some(3));
        assert_eq!(summary.completed, Some(3));
        assert_eq!(summary.failed, Some(0));
        assert_eq!(summary.job_status.as_deref(), Some("Completed"));
    }

    #[test]
    fn test_parse_copier_stream_tolerates_casing_variants() {
        let stdout = "{\"messageType\": \"endOfJob\", \"messageContent\": \"{\\\"totalTransfers\\\": \\\"2\\\", \\\"transfersFailed\\\": 1}\"}";
        let summary = parse_copier_stream(stdout);
        assert_eq!(summary.total, Some(2));
        assert_eq!(summary.failed, Some(1));
    }

    #[test]
    fn test_decide_outcome_zero_is_success() {
        let summary = CopySummary {
            total: Some(0),
            ..Default::default()
        };
        let outcome = decide_outcome(&summary, vec!["/a".to_string()]).unwrap();
        assert!(outcome.is_empty());
    }

    #[test]
    fn test_decide_outcome_failures_raise() {
        let summary = CopySummary {
            total: Some(3),
            completed: Some(2),
            failed: Some(1),
            job_status: None,
        };
        match decide_outcome(&summary, vec![]) {
            Err(DbtapError::CopyTransient(msg)) => assert!(msg.contains("TransfersFailed=1")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_decide_outcome_success_returns_planned() {
        let summary = CopySummary {
            total: Some(2),
            completed: Some(2),
            failed: Some(0),
            job_status: Some("Completed".to_string()),
        };
        let planned = vec!["/a".to_string(), "/b".to_string()];
        assert_eq!(decide_outcome(&summary, planned.clone()).unwrap(), planned);
    }

    #[test]
    fn test_check_planned_exist_flags_missing_local_files() {
        assert!(check_planned_exist(&["/definitely/missing/file.csv".to_string()]).is_err());
        assert!(check_planned_exist(&["https://acct/remote".to_string()]).is_ok());
    }

    #[test]
    fn test_basename_ignores_credential() {
        assert_eq!(basename("/data/out/x_part-0.csv"), "x_part-0.csv");
        assert_eq!(
            basename("https://a.blob.core.windows.net/c/landing/x.csv?sv=1"),
            "x.csv"
        );
    }

    #[test]
    fn test_cleanup_include_pattern_widens_part_number() {
        assert_eq!(
            cleanup_include_pattern("extrct_cust_20240228_part-0.csv").unwrap(),
            "extrct_cust_20240228_part-*.csv"
        );
        assert_eq!(
            cleanup_include_pattern("extrct_cust_20240228_part-17.json").unwrap(),
            "extrct_cust_20240228_part-*.json"
        );
    }

    #[test]
    fn test_cleanup_include_pattern_widens_unrendered_token() {
        assert_eq!(
            cleanup_include_pattern("extrct_cust_20240228_part-{{ part_number }}.csv").unwrap(),
            "extrct_cust_20240228_part-*.csv"
        );
    }

    #[test]
    fn test_cleanup_include_pattern_leaves_partless_names_alone() {
        assert_eq!(
            cleanup_include_pattern("extrct_cust_20240228.ctl").unwrap(),
            "extrct_cust_20240228.ctl"
        );
        assert_eq!(
            cleanup_include_pattern("cust_keys_20240228.key").unwrap(),
            "cust_keys_20240228.key"
        );
    }
}
