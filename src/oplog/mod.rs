//! Operation log: one structured row per job run, appended to a local
//! partitioned sink, plus the pipe-delimited human-log summary.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::JobParameters;
use crate::errors::Result;
use crate::pipeline::ExecutedValues;

/// Compaction threshold: partition-file count above which housekeeping runs.
pub const HOUSEKEEPING_FILE_THRESHOLD: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Success => write!(f, "SUCCESS"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// One operation-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogRow {
    pub job_nm: String,
    pub pos_dt: String,
    pub scheduler_id: String,
    pub job_start_datetime: String,
    pub job_end_datetime: String,
    pub job_status: JobStatus,
    pub job_message: Option<String>,
    pub area_nm: String,
    pub job_seq: i64,
    pub extract_file_path: Vec<String>,
    pub target_file_path: String,
    pub files_size: Vec<u64>,
}

impl OperationLogRow {
    pub fn from_run(
        job: &JobParameters,
        started_at: DateTime<Local>,
        ended_at: DateTime<Local>,
        status: JobStatus,
        message: Option<String>,
        values: &ExecutedValues,
    ) -> Self {
        Self {
            job_nm: job.job_name.clone(),
            pos_dt: job.pos_dt.clone(),
            scheduler_id: job.scheduler_id.clone(),
            job_start_datetime: started_at.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            job_end_datetime: ended_at.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            job_status: status,
            job_message: message,
            area_nm: job.area_name.clone(),
            job_seq: job.job_seq,
            extract_file_path: values.extract_file_paths.clone().unwrap_or_default(),
            target_file_path: values.target_file_path.clone().unwrap_or_default(),
            files_size: values.files_size.clone().unwrap_or_default(),
        }
    }

    /// Pipe-delimited block for the human log.
    pub fn summary_block(&self) -> String {
        format!(
            "{divider}\nExtraction Job Log Summary\n\
             job_nm|pos_dt|scheduler_id|job_start_datetime|job_end_datetime|job_status|job_message|area_nm|job_seq|extract_file_path|target_file_path|files_size\n\
             {}|{}|{}|{}|{}|{}|{}|{}|{}|{:?}|{}|{:?}\n{divider}",
            self.job_nm,
            self.pos_dt,
            self.scheduler_id,
            self.job_start_datetime,
            self.job_end_datetime,
            self.job_status,
            self.job_message.as_deref().unwrap_or(""),
            self.area_nm,
            self.job_seq,
            self.extract_file_path,
            self.target_file_path,
            self.files_size,
            divider = "=".repeat(30),
        )
    }
}

/// Append-only JSONL sink partitioned by `pos_dt`, with lock-guarded
/// compaction.
pub struct OperationLog {
    root: PathBuf,
}

impl OperationLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn partition_dir(&self, pos_dt: &str) -> PathBuf {
        self.root.join(format!("pos_dt={pos_dt}"))
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "oplog".to_string());
        name.push_str(".lock");
        self.root
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(name)
    }

    /// Append one row as its own partition file.
    pub fn append(&self, row: &OperationLogRow) -> Result<PathBuf> {
        let dir = self.partition_dir(&row.pos_dt);
        fs::create_dir_all(&dir)?;
        let file_name = format!(
            "part-{}-{}.jsonl",
            Local::now().format("%Y%m%d%H%M%S%f"),
            std::process::id()
        );
        let path = dir.join(file_name);
        let mut file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(row)?)?;
        info!(
            "Job '{}' status logged as '{}'.",
            row.job_nm, row.job_status
        );
        Ok(path)
    }

    fn partition_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.root.exists() {
            return Ok(files);
        }
        for partition in fs::read_dir(&self.root)? {
            let partition = partition?;
            if !partition.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(partition.path())? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Compact the partition files when they exceed the threshold.
    ///
    /// The sidecar lock is non-blocking: failure to acquire means another
    /// process is compacting and this one skips. Returns whether a
    /// compaction ran.
    pub fn housekeeping(&self) -> Result<bool> {
        let files = self.partition_files()?;
        if files.len() <= HOUSEKEEPING_FILE_THRESHOLD {
            return Ok(false);
        }

        let lock_file = File::create(self.lock_path())?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let guard = match lock.try_write() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("operation-log lock is held elsewhere, skipping compaction");
                return Ok(false);
            }
        };

        for partition in fs::read_dir(&self.root)? {
            let partition = partition?;
            if !partition.file_type()?.is_dir() {
                continue;
            }
            let mut parts: Vec<PathBuf> = fs::read_dir(partition.path())?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().map(|e| e == "jsonl").unwrap_or(false))
                .collect();
            parts.sort();
            if parts.len() <= 1 {
                continue;
            }

            let mut merged = String::new();
            for part in &parts {
                merged.push_str(&fs::read_to_string(part)?);
            }
            let compacted = partition.path().join(format!(
                "part-{}-{}-compacted.jsonl",
                Local::now().format("%Y%m%d%H%M%S%f"),
                std::process::id()
            ));
            fs::write(&compacted, merged)?;
            for part in parts {
                fs::remove_file(part)?;
            }
        }

        drop(guard);
        info!("operation-log compaction completed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(pos_dt: &str) -> OperationLogRow {
        OperationLogRow {
            job_nm: "cust_daily".to_string(),
            pos_dt: pos_dt.to_string(),
            scheduler_id: "sched-1".to_string(),
            job_start_datetime: "2024-02-28 01:00:00.000000".to_string(),
            job_end_datetime: "2024-02-28 01:05:00.000000".to_string(),
            job_status: JobStatus::Success,
            job_message: None,
            area_nm: "sales".to_string(),
            job_seq: 1,
            extract_file_path: vec!["/out/a.csv".to_string()],
            target_file_path: "https://acct.blob.core.windows.net/c/p".to_string(),
            files_size: vec![128],
        }
    }

    #[test]
    fn test_append_creates_partitioned_file() {
        let dir = TempDir::new().unwrap();
        let log = OperationLog::new(dir.path().join("extraction"));
        let path = log.append(&row("2024-02-28")).unwrap();
        assert!(path.to_string_lossy().contains("pos_dt=2024-02-28"));
        let content = fs::read_to_string(path).unwrap();
        let parsed: OperationLogRow = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed.job_status, JobStatus::Success);
    }

    #[test]
    fn test_housekeeping_skips_below_threshold() {
        let dir = TempDir::new().unwrap();
        let log = OperationLog::new(dir.path().join("extraction"));
        log.append(&row("2024-02-28")).unwrap();
        assert!(!log.housekeeping().unwrap());
    }

    #[test]
    fn test_housekeeping_compacts_over_threshold() {
        let dir = TempDir::new().unwrap();
        let log = OperationLog::new(dir.path().join("extraction"));
        for _ in 0..(HOUSEKEEPING_FILE_THRESHOLD + 5) {
            log.append(&row("2024-02-28")).unwrap();
        }
        assert!(log.housekeeping().unwrap());

        let files = log.partition_files().unwrap();
        assert_eq!(files.len(), 1);
        let content = fs::read_to_string(&files[0]).unwrap();
        assert_eq!(content.lines().count(), HOUSEKEEPING_FILE_THRESHOLD + 5);
    }

    #[test]
    fn test_summary_block_is_pipe_delimited() {
        let block = row("2024-02-28").summary_block();
        assert!(block.contains("Extraction Job Log Summary"));
        assert!(block.contains("cust_daily|2024-02-28|sched-1|"));
    }
}
