//! Preprocess escape hatch: run an arbitrary command from the config.

use tracing::info;

use crate::config::PreprocessParams;
use crate::errors::{DbtapError, Result};
use crate::shell::CommandRunner;

/// Run the configured shell or interpreter command. The exit code is the
/// whole contract: non-zero fails the stage.
pub async fn run(params: &PreprocessParams, runner: &dyn CommandRunner) -> Result<()> {
    let command = params
        .shell_command
        .as_deref()
        .or(params.python_command.as_deref())
        .ok_or_else(|| {
            DbtapError::ConfigInvalid(
                "preprocess task requires 'shell_command' or 'python_command'".to_string(),
            )
        })?;

    info!("Running preprocess command: {command}");
    let result = runner
        .run("sh", &["-c".to_string(), command.to_string()], &[])
        .await?;

    if !result.success() {
        return Err(DbtapError::Shell(format!(
            "preprocess command failed with exit code: {}, output: \n{}, \nerror_message: \n{}",
            result.exit_code, result.stdout, result.stderr
        )));
    }
    info!("Preprocess command output: {}", result.stdout);
    Ok(())
}
