use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::Result;

/// Captured outcome of one external process run.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Seam for everything that shells out (unzip, gpg, the key agent, azcopy).
///
/// Tasks depend on this trait rather than spawning processes directly, so
/// tests can substitute a scripted runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        envs: &[(String, String)],
    ) -> Result<CommandResult>;
}

/// Production runner over `tokio::process`.
///
/// Arguments are passed as an argv vector, never through a shell, so file
/// names with spaces or metacharacters cannot be reinterpreted.
#[derive(Debug, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        envs: &[(String, String)],
    ) -> Result<CommandResult> {
        // Arguments may carry credentials (SAS tokens, passphrases), so
        // only the program name reaches the log
        debug!("Running command: {program} with {} argument(s)", args.len());
        let output = Command::new(program)
            .args(args)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            // -1 stands in for termination by signal
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
