//! Pipeline executor: the fixed stage sequence with bypass and run-only
//! semantics.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::config::{JobConfig, JobParameters, TaskEntry, TaskParams};
use crate::errors::{DbtapError, Result};
use crate::settings::Settings;
use crate::shell::CommandRunner;
use crate::task::key_file::{HsmKeyAgent, KeyAgent};
use crate::task::{archive, control_file, decrypt, eban_in, extract, key_file, preprocess, transfer};
use crate::task::FileDescriptor;

/// Values captured for the operation log. Always populated as far as the
/// run got, even when a stage fails.
#[derive(Debug, Clone, Default)]
pub struct ExecutedValues {
    pub extract_file_paths: Option<Vec<String>>,
    pub target_file_path: Option<String>,
    pub files_size: Option<Vec<u64>>,
    pub ctl_file_details: Option<String>,
}

/// One job run over a validated config.
pub struct Pipeline<'a> {
    config: &'a JobConfig,
    job: &'a JobParameters,
    settings: &'a Settings,
    runner: Arc<dyn CommandRunner>,
    key_agent: Option<Arc<dyn KeyAgent>>,
    pub executed_values: ExecutedValues,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a JobConfig,
        job: &'a JobParameters,
        settings: &'a Settings,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            job,
            settings,
            runner,
            key_agent: None,
            executed_values: ExecutedValues::default(),
        }
    }

    /// Substitute the key agent (tests).
    pub fn with_key_agent(mut self, agent: Arc<dyn KeyAgent>) -> Self {
        self.key_agent = Some(agent);
        self
    }

    /// The entry for `slot` when it is present, not bypassed, and selected
    /// by the run-only filter.
    fn runnable<'b>(&self, entry: &'b Option<TaskEntry>, slot: &str) -> Option<&'b TaskEntry> {
        match entry {
            Some(entry) if !entry.bypass_flag && self.job.slot_selected(slot) => Some(entry),
            _ => None,
        }
    }

    fn wrong_params(slot: &str, entry: &TaskEntry) -> DbtapError {
        DbtapError::PipelineError(format!(
            "module '{}' cannot serve the '{slot}' slot",
            entry.module_name
        ))
    }

    async fn execute_eban_in(&self) -> Result<()> {
        let slot = "eban_in_extractor_task";
        let Some(entry) = self.runnable(&self.config.tasks.eban_in_extractor_task, slot) else {
            return Ok(());
        };
        info!("Start EBAN-IN Extractor Task");
        match &entry.params {
            TaskParams::EbanInExtractor(_) => {
                eban_in::run(self.job, self.settings, self.runner.as_ref()).await
            }
            _ => Err(Self::wrong_params(slot, entry)),
        }
    }

    async fn execute_source_extractor(&mut self) -> Result<Option<Vec<FileDescriptor>>> {
        let slot = "source_data_extractor_task";
        let Some(entry) = self.runnable(&self.config.tasks.source_data_extractor_task, slot) else {
            return Ok(None);
        };
        info!("Start Source Data Extractor Task");
        let file_infos = match &entry.params {
            TaskParams::RelationalDataExtractor(params) => {
                extract::run_relational(params, self.job, self.settings).await?
            }
            TaskParams::DocumentDataExtractor(params) => {
                extract::run_document(params, self.job, self.settings).await?
            }
            _ => return Err(Self::wrong_params(slot, entry)),
        };
        self.executed_values.files_size = Some(file_infos.iter().map(|f| f.size).collect());
        self.executed_values.extract_file_paths =
            Some(file_infos.iter().map(|f| f.location.clone()).collect());
        Ok(Some(file_infos))
    }

    async fn execute_control_file(&mut self) -> Result<()> {
        let slot = "generate_control_file_task";
        let Some(entry) = self.runnable(&self.config.tasks.generate_control_file_task, slot) else {
            return Ok(());
        };
        info!("Start Generate Control File Task");
        let (_file_name, details) = match &entry.params {
            TaskParams::RelationalControlFileGenerator(params) => {
                control_file::run_relational(params, self.job, self.settings).await?
            }
            TaskParams::DocumentControlFileGenerator(params) => {
                control_file::run_document(params, self.job, self.settings).await?
            }
            _ => return Err(Self::wrong_params(slot, entry)),
        };
        self.executed_values.ctl_file_details = Some(details);
        Ok(())
    }

    async fn execute_file_extractor(
        &self,
        file_infos: Option<Vec<FileDescriptor>>,
    ) -> Result<Option<Vec<FileDescriptor>>> {
        let slot = "file_extractor_task";
        let Some(entry) = self.runnable(&self.config.tasks.file_extractor_task, slot) else {
            return Ok(file_infos);
        };
        info!("Start File Extractor Task");
        match &entry.params {
            TaskParams::ZipFileExtractor(params) => {
                Ok(Some(archive::run(params, self.runner.as_ref()).await?))
            }
            _ => Err(Self::wrong_params(slot, entry)),
        }
    }

    async fn execute_preprocess(&self) -> Result<()> {
        let slot = "preprocess_extractor_task";
        let Some(entry) = self.runnable(&self.config.tasks.preprocess_extractor_task, slot) else {
            return Ok(());
        };
        info!("Start Preprocess Command Task");
        match &entry.params {
            TaskParams::SubmitCommandScript(params) => {
                preprocess::run(params, self.runner.as_ref()).await
            }
            _ => Err(Self::wrong_params(slot, entry)),
        }
    }

    async fn execute_decryptor(
        &self,
        file_infos: Option<Vec<FileDescriptor>>,
    ) -> Result<Option<Vec<FileDescriptor>>> {
        let slot = "file_decryptor_task";
        let Some(entry) = self.runnable(&self.config.tasks.file_decryptor_task, slot) else {
            return Ok(file_infos);
        };
        info!("Start File Decryptor Task");
        let decrypted = match &entry.params {
            TaskParams::PgpFileDecryptor(params) => {
                decrypt::run_pgp(
                    params,
                    self.settings,
                    file_infos.as_deref(),
                    Arc::clone(&self.runner),
                )
                .await?
            }
            TaskParams::GpgFileDecryptor(params) => {
                decrypt::run_gpg(
                    params,
                    self.settings,
                    file_infos.as_deref(),
                    Arc::clone(&self.runner),
                )
                .await?
            }
            _ => return Err(Self::wrong_params(slot, entry)),
        };
        Ok(Some(decrypted))
    }

    async fn execute_key_file_generator(
        &self,
        file_infos: Option<Vec<FileDescriptor>>,
    ) -> Result<Option<Vec<FileDescriptor>>> {
        let slot = "hsm_encryption_key_file_generator_task";
        let Some(entry) = self.runnable(
            &self.config.tasks.hsm_encryption_key_file_generator_task,
            slot,
        ) else {
            return Ok(file_infos);
        };
        info!("Start HSM encryption key generator Task");
        let TaskParams::HsmKeyFileGenerator(params) = &entry.params else {
            return Err(Self::wrong_params(slot, entry));
        };

        let agent: Arc<dyn KeyAgent> = match &self.key_agent {
            Some(agent) => Arc::clone(agent),
            None => Arc::new(HsmKeyAgent {
                settings: self.settings.hsm()?,
                runner: Arc::clone(&self.runner),
            }),
        };

        let with_key_file =
            key_file::run(params, self.job, file_infos.as_deref(), agent.as_ref()).await?;
        Ok(Some(with_key_file))
    }

    async fn execute_transfer(&mut self, file_infos: Option<Vec<FileDescriptor>>) -> Result<()> {
        let slot = "azcopy_data_transfer_task";
        let Some(entry) = self.runnable(&self.config.tasks.azcopy_data_transfer_task, slot) else {
            return Ok(());
        };
        info!("Start Transfer File Azcopy Task");
        let TaskParams::AzcopyDataTransfer(params) = &entry.params else {
            return Err(Self::wrong_params(slot, entry));
        };
        let display_url =
            transfer::run(params, file_infos.as_deref(), self.runner.as_ref()).await?;
        self.executed_values.target_file_path = Some(display_url);
        Ok(())
    }

    /// Run the declared stages in order. Stages that produce files update
    /// the rolling descriptor list; skipped stages pass it through, so a
    /// rerun restricted to the transfer slot still ships whatever an
    /// earlier run extracted.
    #[instrument(name = "pipeline", skip_all, fields(job = %self.config.job_name))]
    pub async fn execute(&mut self) -> Result<()> {
        info!("Start Extraction Pipeline Execution");

        self.execute_eban_in().await?;
        let mut file_infos = self.execute_source_extractor().await?;
        self.execute_control_file().await?;
        file_infos = self.execute_file_extractor(file_infos).await?;
        self.execute_preprocess().await?;
        file_infos = self.execute_decryptor(file_infos).await?;
        file_infos = self.execute_key_file_generator(file_infos).await?;
        self.execute_transfer(file_infos).await?;

        info!("Extraction Pipeline Execution Completed.");
        Ok(())
    }
}
