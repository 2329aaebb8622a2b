//! Archive extraction into a scratch directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use crate::config::ZipExtractorParams;
use crate::errors::{DbtapError, Result};
use crate::shell::CommandRunner;
use crate::task::{describe_file, FileDescriptor};

/// Scratch directory for an archive: the configured location, or
/// `_tmp_<stem>` next to the archive itself.
pub fn scratch_dir(source_file_location: &str, unzip_location: &str) -> PathBuf {
    if unzip_location.trim().is_empty() {
        let source = Path::new(source_file_location);
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        source
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("_tmp_{stem}"))
    } else {
        PathBuf::from(unzip_location)
    }
}

/// Enumerate the regular files under `dir`, sorted for stable ordering.
pub fn list_extracted_files(dir: &Path) -> Result<Vec<FileDescriptor>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            paths.push(entry.path().to_path_buf());
        }
    }
    paths.sort();
    paths.iter().map(describe_file).collect()
}

/// Unpack the archive into a freshly re-created scratch directory and return
/// descriptors for everything inside it.
pub async fn run(
    params: &ZipExtractorParams,
    runner: &dyn CommandRunner,
) -> Result<Vec<FileDescriptor>> {
    let scratch = scratch_dir(&params.source_file_location, &params.unzip_location);

    // Any prior scratch content would leak stale files into this run
    if scratch.exists() {
        fs::remove_dir_all(&scratch)?;
    }
    fs::create_dir_all(&scratch)?;
    info!("Created scratch directory {}", scratch.display());

    let args = vec![
        params.source_file_location.clone(),
        "-d".to_string(),
        scratch.to_string_lossy().into_owned(),
    ];
    let result = runner.run("unzip", &args, &[]).await?;
    if !result.success() {
        return Err(DbtapError::Shell(format!(
            "Unzip command failed with exit code: {}, output: \n{}, \nerror_message: \n{}",
            result.exit_code, result.stdout, result.stderr
        )));
    }
    info!("Output from the unzip command: \n{}", result.stdout);

    list_extracted_files(&scratch)
}
