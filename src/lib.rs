//! # dbtap
//!
//! Configuration-driven batch extraction: database to numbered files to
//! blob storage.
//!
//! ## Overview
//!
//! For each named job, dbtap:
//! - **Extracts** a bounded result set from a relational or document source
//! - **Partitions** it into fixed-size, sequentially numbered CSV/JSON files
//!   with a `.ctl` sidecar summarizing the slice
//! - **Prepares** file-based inputs where needed: unzip archives, decrypt
//!   payloads, generate a per-date key-mapping file via the key agent
//! - **Ships** the file set to a blob-storage prefix with pre-transfer
//!   cleanup, retry, and per-file success verification
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use dbtap::cmd::{run_job, Cli};
//!
//! #[tokio::main]
//! async fn main() -> dbtap::Result<()> {
//!     let cli = Cli::parse();
//!     run_job(&cli).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Templated job configs**: JSON templates with `{{ name }}` placeholders
//!   and CLI overlays, validated into typed task parameters
//! - **Idempotent reruns**: leftover part files and stale destination
//!   siblings are cleaned before each run
//! - **Retry Logic**: capped exponential backoff around every external copy
//! - **Structured Logging**: JSON and human-readable log formats plus a
//!   per-run operation-log row
//!
//! ## Architecture
//!
//! ```text
//! DB / document source → part files (+ ctl, key) → azcopy → blob storage
//! ```

// Public API exports
pub use errors::{DbtapError, Result};

// Public modules
pub mod cmd;
pub mod config;
pub mod errors;
pub mod log;
pub mod oplog;
pub mod pipeline;
pub mod retry;
pub mod settings;
pub mod shell;
pub mod source;
pub mod task;
pub mod writer;
