use thiserror::Error;
use tracing_subscriber::filter::FromEnvError;

/// Main error type for dbtap operations
#[derive(Error, Debug)]
pub enum DbtapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Document store error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("BSON conversion error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Glob pattern error: {0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Glob walk error: {0}")]
    GlobWalk(#[from] glob::GlobError),

    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Date parse error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Tracing From Env Error: {0}")]
    FromEnvError(#[from] FromEnvError),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Missing secret: {0}")]
    ConfigMissingSecret(String),

    #[error("Unknown date rule: {0}")]
    DateRuleUnknown(String),

    #[error("No records: {0}")]
    NoRecords(String),

    #[error("Copy failed: {0}")]
    CopyTransient(String),

    #[error("Decrypt input error: {0}")]
    DecryptInputBad(String),

    #[error("Key server error: {0}")]
    KeyServerError(String),

    #[error("Shell error: {0}")]
    Shell(String),

    #[error("Writer error: {0}")]
    WriterError(String),

    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

impl DbtapError {
    /// Error kind plus message, the shape recorded as `job_message` in the
    /// operation log.
    pub fn kind_and_text(&self) -> String {
        let kind = match self {
            DbtapError::Io(_) => "FilesystemError",
            DbtapError::SerdeJson(_) => "SerdeJson",
            DbtapError::Sqlx(_) => "DriverTransient",
            DbtapError::Mongo(_) => "DriverTransient",
            DbtapError::Bson(_) => "DriverTransient",
            DbtapError::Csv(_) => "WriterError",
            DbtapError::RegexError(_) => "RegexError",
            DbtapError::GlobPattern(_) => "FilesystemError",
            DbtapError::GlobWalk(_) => "FilesystemError",
            DbtapError::WalkDir(_) => "FilesystemError",
            DbtapError::Base64(_) => "ConfigMissingSecret",
            DbtapError::Hex(_) => "KeyServerError",
            DbtapError::DateParse(_) => "ConfigInvalid",
            DbtapError::JoinError(_) => "PipelineError",
            DbtapError::FromEnvError(_) => "ConfigInvalid",
            DbtapError::ConfigInvalid(_) => "ConfigInvalid",
            DbtapError::ConfigMissingSecret(_) => "ConfigMissingSecret",
            DbtapError::DateRuleUnknown(_) => "DateRuleUnknown",
            DbtapError::NoRecords(_) => "NoRecords",
            DbtapError::CopyTransient(_) => "CopyTransient",
            DbtapError::DecryptInputBad(_) => "DecryptInputBad",
            DbtapError::KeyServerError(_) => "KeyServerError",
            DbtapError::Shell(_) => "Shell",
            DbtapError::WriterError(_) => "WriterError",
            DbtapError::PipelineError(_) => "PipelineError",
        };
        format!("{kind}: {self}")
    }
}

/// Convenience Result type that uses DbtapError
pub type Result<T> = std::result::Result<T, DbtapError>;
