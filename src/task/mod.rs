//! Pipeline tasks, one module per slot kind.

pub mod archive;
pub mod control_file;
pub mod decrypt;
pub mod eban_in;
pub mod extract;
pub mod key_file;
pub mod preprocess;
pub mod transfer;

use std::fs;
use std::path::Path;

use chrono::{DateTime, Local};

use crate::errors::Result;

/// The currency between stages: one produced file, never mutated after
/// construction.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDescriptor {
    pub location: String,
    pub size: u64,
    pub created_at: DateTime<Local>,
}

/// Build a descriptor for a file that exists on disk.
pub fn describe_file(location: impl AsRef<Path>) -> Result<FileDescriptor> {
    let path = location.as_ref();
    let metadata = fs::metadata(path)?;
    Ok(FileDescriptor {
        location: path.to_string_lossy().into_owned(),
        size: metadata.len(),
        created_at: Local::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_describe_file_captures_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"a,b\n1,2\n").unwrap();

        let descriptor = describe_file(&path).unwrap();
        assert_eq!(descriptor.size, 8);
        assert!(descriptor.location.ends_with("out.csv"));
    }

    #[test]
    fn test_describe_file_missing_is_an_error() {
        assert!(describe_file("/no/such/file").is_err());
    }
}
