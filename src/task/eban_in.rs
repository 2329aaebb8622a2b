//! Foundation-script extraction, the optional slot 0 of the pipeline.

use tracing::info;

use crate::config::JobParameters;
use crate::errors::{DbtapError, Result};
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::settings::Settings;
use crate::shell::CommandRunner;

/// Run the per-project foundation extraction script with the scheduler id
/// and run date as its arguments, under the standard retry envelope.
pub async fn run(
    job: &JobParameters,
    settings: &Settings,
    runner: &dyn CommandRunner,
) -> Result<()> {
    let script = format!(
        "/app_{0}/{0}/script/extraction/foundation/mdp_extraction_foundation.sh",
        settings.project
    );
    let args = vec![job.scheduler_id.clone(), job.pos_dt.clone()];

    retry_with_policy(&RetryPolicy::transfer(), "EBAN-IN extraction", |retry| {
        let script = script.clone();
        let args = args.clone();
        async move {
            info!(
                "Executing EBAN-IN extraction script with scheduler_id: {}, pos_dt: {}. Retry count: {retry}",
                job.scheduler_id, job.pos_dt
            );
            let result = runner.run(&script, &args, &[]).await?;
            if !result.success() {
                return Err(DbtapError::Shell(format!(
                    "EBAN-IN extraction returned with exit_code: {}, output: \n{}, \nerror_message: \n{}",
                    result.exit_code, result.stdout, result.stderr
                )));
            }
            info!("Output from the EBAN-IN script: {}", result.stdout);
            Ok(())
        }
    })
    .await
}
