//! Job configuration: typed models, the placeholder substitutor, and the
//! loader that turns a JSON template plus CLI overlays into a validated
//! [`JobConfig`].

pub mod dates;
pub mod templating;

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{DbtapError, Result};
use crate::settings::Settings;
use crate::writer::{OpenPolicy, QuoteMode, WritePolicy};
use templating::{render_template, DateParts, Undefined};

/// Run context for one job invocation. Mutable only while the config is
/// being loaded; the pipeline reads it immutably.
#[derive(Debug, Clone, Default)]
pub struct JobParameters {
    pub project: String,
    pub pos_dt: String,
    pub config_file_path: String,
    pub job_name: String,
    pub area_name: String,
    pub pipeline_name: String,
    pub job_seq: i64,
    pub job_info: serde_json::Map<String, Value>,
    pub scheduler_id: String,
    pub adb_job_id: String,
    pub adb_run_id: String,
    pub run_only_task: Option<Vec<String>>,
}

impl JobParameters {
    /// Whether `slot` should run under the run-only filter.
    pub fn slot_selected(&self, slot: &str) -> bool {
        match &self.run_only_task {
            None => true,
            Some(selected) => selected.iter().any(|name| name == slot),
        }
    }
}

// --- shared parameter fragments -------------------------------------------

fn default_part_suffix() -> String {
    "part".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    10_000_000
}

fn default_csv_extension() -> String {
    "csv".to_string()
}

fn default_ctl_extension() -> String {
    "ctl".to_string()
}

fn default_key_extension() -> String {
    "key".to_string()
}

fn default_decrypt_suffix() -> String {
    "_decrypted".to_string()
}

fn default_copy_command() -> String {
    "cp".to_string()
}

/// Pieces substituted into `full_file_name` before the part number is known.
#[derive(Debug, Clone, Deserialize)]
pub struct FileNameFormat {
    pub base_file_name: String,
    pub date_suffix: String,
    #[serde(default = "default_part_suffix")]
    pub part_suffix: String,
}

impl FileNameFormat {
    pub fn mapping(&self) -> IndexMap<String, String> {
        let mut map = IndexMap::new();
        map.insert("base_file_name".to_string(), self.base_file_name.clone());
        map.insert("date_suffix".to_string(), self.date_suffix.clone());
        map.insert("part_suffix".to_string(), self.part_suffix.clone());
        map
    }
}

/// Delimiter/quoting options of the delimited writer, config-file shape.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WriteOption {
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub quotechar: Option<String>,
    #[serde(default)]
    pub quoting: Option<QuoteMode>,
    #[serde(default)]
    pub escapechar: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteProperty {
    #[serde(default = "default_true")]
    pub header: bool,
    #[serde(default)]
    pub option: WriteOption,
}

impl WriteProperty {
    pub fn to_policy(&self) -> Result<WritePolicy> {
        let single_byte = |label: &str, raw: &Option<String>, default: u8| -> Result<u8> {
            match raw {
                None => Ok(default),
                Some(s) if s.len() == 1 => Ok(s.as_bytes()[0]),
                Some(s) => Err(DbtapError::ConfigInvalid(format!(
                    "{label} must be a single character, got '{s}'"
                ))),
            }
        };
        Ok(WritePolicy {
            include_header: self.header,
            delimiter: single_byte("delimiter", &self.option.delimiter, b',')?,
            quote: single_byte("quotechar", &self.option.quotechar, b'"')?,
            quoting: self.option.quoting.unwrap_or(QuoteMode::Minimal),
            escape: match &self.option.escapechar {
                None => None,
                Some(s) => Some(single_byte("escapechar", &Some(s.clone()), b'\\')?),
            },
        })
    }
}

/// File-open options, config-file shape (`mode` as in `open(2)` strings).
#[derive(Debug, Clone, Deserialize)]
pub struct FileOption {
    #[serde(default = "FileOption::default_mode")]
    pub mode: String,
    #[serde(default)]
    pub encoding: Option<String>,
}

impl Default for FileOption {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
            encoding: None,
        }
    }
}

impl FileOption {
    fn default_mode() -> String {
        "a".to_string()
    }

    pub fn to_policy(&self) -> Result<OpenPolicy> {
        match self.mode.as_str() {
            "a" => Ok(OpenPolicy { append: true }),
            "w" => Ok(OpenPolicy { append: false }),
            other => Err(DbtapError::ConfigInvalid(format!(
                "unsupported file mode '{other}', expected 'a' or 'w'"
            ))),
        }
    }
}

// --- per-task parameter payloads ------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EbanInParams {}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationalExtractorParams {
    pub connection_name: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub sql_file_path: Option<String>,
    pub extract_file_location: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub allow_zero_record: bool,
    pub file_name_format: FileNameFormat,
    pub full_file_name: String,
    #[serde(default = "default_csv_extension")]
    pub file_extension: String,
    #[serde(default)]
    pub file_option: FileOption,
    pub write_property: WriteProperty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentExtractorParams {
    pub connection_name: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub json_file_path: Option<String>,
    pub extract_file_location: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub allow_zero_record: bool,
    pub file_name_format: FileNameFormat,
    pub full_file_name: String,
    #[serde(default = "default_csv_extension")]
    pub file_extension: String,
    #[serde(default)]
    pub file_option: FileOption,
    pub write_property: WriteProperty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlFileParams {
    pub connection_name: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub sql_file_path: Option<String>,
    pub extract_file_location: String,
    pub header: bool,
    #[serde(default)]
    pub header_columns: Option<Vec<String>>,
    pub file_name_format: FileNameFormat,
    pub full_file_name: String,
    #[serde(default = "default_ctl_extension")]
    pub file_extension: String,
    #[serde(default)]
    pub file_option: FileOption,
    pub write_property: WriteProperty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZipExtractorParams {
    pub source_file_location: String,
    #[serde(default)]
    pub unzip_location: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PreprocessParams {
    #[serde(default)]
    pub shell_command: Option<String>,
    #[serde(default)]
    pub python_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PgpDecryptorParams {
    pub source_system_name: String,
    #[serde(default)]
    pub source_file_location: String,
    #[serde(default = "default_decrypt_suffix")]
    pub file_name_suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpgDecryptorParams {
    pub source_system_name: String,
    #[serde(default)]
    pub source_file_location: String,
    #[serde(default = "default_decrypt_suffix")]
    pub file_name_suffix: String,
    #[serde(default)]
    pub cleanup_flag: bool,
    #[serde(default)]
    pub file_complete_check_flag: bool,
}

/// One fixed-width field: 1-based byte offset plus size.
#[derive(Debug, Clone, Deserialize)]
pub struct FixedWidthField {
    pub field_name: String,
    pub offset: usize,
    pub size: usize,
    #[serde(default, rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub is_encrypted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyFileGeneratorParams {
    #[serde(default)]
    pub source_file_location: String,
    pub length_mapping_config: IndexMap<String, Vec<FixedWidthField>>,
    #[serde(default)]
    pub number_of_row_header: usize,
    #[serde(default)]
    pub number_of_row_footer: usize,
    pub header_columns: Vec<String>,
    pub file_name_format: FileNameFormat,
    pub full_file_name: String,
    #[serde(default = "default_key_extension")]
    pub file_extension: String,
    #[serde(default)]
    pub file_option: FileOption,
    pub write_property: WriteProperty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    Sas,
    ServicePrincipal,
}

/// Source or destination of a transfer, tagged by `type` in the config.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum TransferLocation {
    LocalLocation {
        filepath: String,
    },
    #[serde(rename = "ADLSLocation")]
    AdlsLocation {
        account_name: String,
        container_name: String,
        #[serde(default)]
        sas_token: String,
        filepath: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferParams {
    #[serde(default = "default_copy_command")]
    pub azcopy_command: String,
    pub target: TransferLocation,
    #[serde(default)]
    pub source: Option<TransferLocation>,
    #[serde(default = "default_true")]
    pub cleanup_dest_flag: bool,
    #[serde(default)]
    pub cleanup_options: Vec<String>,
    #[serde(default)]
    pub azcopy_options: Vec<String>,
    #[serde(default)]
    pub allow_empty_file: bool,
    #[serde(default)]
    pub allow_zero_file: bool,
    #[serde(default)]
    pub cleanup_source_flag: bool,
    #[serde(default)]
    pub auth_mode: AuthMode,
}

// --- task registry --------------------------------------------------------

/// Typed parameter payload, one variant per known module name.
#[derive(Debug, Clone)]
pub enum TaskParams {
    EbanInExtractor(EbanInParams),
    RelationalDataExtractor(RelationalExtractorParams),
    DocumentDataExtractor(DocumentExtractorParams),
    RelationalControlFileGenerator(ControlFileParams),
    DocumentControlFileGenerator(ControlFileParams),
    ZipFileExtractor(ZipExtractorParams),
    SubmitCommandScript(PreprocessParams),
    PgpFileDecryptor(PgpDecryptorParams),
    GpgFileDecryptor(GpgDecryptorParams),
    HsmKeyFileGenerator(KeyFileGeneratorParams),
    AzcopyDataTransfer(TransferParams),
}

fn parse_params<T: serde::de::DeserializeOwned>(module: &str, raw: Value) -> Result<T> {
    serde_json::from_value(raw)
        .map_err(|e| DbtapError::ConfigInvalid(format!("invalid parameters for {module}: {e}")))
}

/// Resolve a config `module_name` into its typed parameter payload.
///
/// The registry is the complete set of implementations; there is no dynamic
/// lookup anywhere else.
pub fn resolve_module(module_name: &str, raw: Value) -> Result<TaskParams> {
    let params = match module_name {
        "eban_in_extractor" => TaskParams::EbanInExtractor(parse_params(module_name, raw)?),
        "relational_data_extractor" => {
            let p: RelationalExtractorParams = parse_params(module_name, raw)?;
            validate_query_source(&p.query, &p.sql_file_path, "sql_file_path")?;
            TaskParams::RelationalDataExtractor(p)
        }
        "document_data_extractor" => {
            let p: DocumentExtractorParams = parse_params(module_name, raw)?;
            validate_query_source(&p.query, &p.json_file_path, "json_file_path")?;
            TaskParams::DocumentDataExtractor(p)
        }
        "relational_control_file_generator" => {
            let p: ControlFileParams = parse_params(module_name, raw)?;
            validate_control_file(&p)?;
            TaskParams::RelationalControlFileGenerator(p)
        }
        "document_control_file_generator" => {
            let p: ControlFileParams = parse_params(module_name, raw)?;
            validate_control_file(&p)?;
            TaskParams::DocumentControlFileGenerator(p)
        }
        "zip_file_extractor" => TaskParams::ZipFileExtractor(parse_params(module_name, raw)?),
        "submit_command_script" => TaskParams::SubmitCommandScript(parse_params(module_name, raw)?),
        "pgp_file_decryptor" => TaskParams::PgpFileDecryptor(parse_params(module_name, raw)?),
        "gpg_file_decryptor" => TaskParams::GpgFileDecryptor(parse_params(module_name, raw)?),
        "hsm_key_file_generator" => {
            let p: KeyFileGeneratorParams = parse_params(module_name, raw)?;
            if p.length_mapping_config.len() != 1 {
                return Err(DbtapError::ConfigInvalid(
                    "length_mapping_config must declare exactly one section".to_string(),
                ));
            }
            TaskParams::HsmKeyFileGenerator(p)
        }
        "azcopy_data_transfer" => TaskParams::AzcopyDataTransfer(parse_params(module_name, raw)?),
        other => {
            return Err(DbtapError::ConfigInvalid(format!(
                "unknown module_name '{other}'"
            )))
        }
    };
    Ok(params)
}

fn validate_query_source(
    query: &Option<String>,
    file_path: &Option<String>,
    file_field: &str,
) -> Result<()> {
    match (query, file_path) {
        (None, None) => Err(DbtapError::ConfigInvalid(format!(
            "Either 'query' or '{file_field}' is required."
        ))),
        (Some(_), Some(_)) => Err(DbtapError::ConfigInvalid(format!(
            "Expect only one input 'query' or '{file_field}'."
        ))),
        _ => Ok(()),
    }
}

fn validate_control_file(params: &ControlFileParams) -> Result<()> {
    validate_query_source(&params.query, &params.sql_file_path, "sql_file_path")?;
    if params.header && params.header_columns.is_none() {
        return Err(DbtapError::ConfigInvalid(
            "header_columns is required if header is true".to_string(),
        ));
    }
    Ok(())
}

// --- job config -----------------------------------------------------------

/// One task slot: the resolved payload plus its bypass flag.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub module_name: String,
    pub bypass_flag: bool,
    pub params: TaskParams,
}

/// The eight fixed pipeline slots.
#[derive(Debug, Clone, Default)]
pub struct TaskSlots {
    pub eban_in_extractor_task: Option<TaskEntry>,
    pub source_data_extractor_task: Option<TaskEntry>,
    pub generate_control_file_task: Option<TaskEntry>,
    pub file_extractor_task: Option<TaskEntry>,
    pub preprocess_extractor_task: Option<TaskEntry>,
    pub file_decryptor_task: Option<TaskEntry>,
    pub hsm_encryption_key_file_generator_task: Option<TaskEntry>,
    pub azcopy_data_transfer_task: Option<TaskEntry>,
}

/// A fully rendered, fully typed job definition.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub job_name: String,
    pub pipeline_name: String,
    pub job_info: serde_json::Map<String, Value>,
    pub area_name: String,
    pub job_seq: i64,
    pub tasks: TaskSlots,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTaskEntry {
    module_name: String,
    #[serde(default)]
    bypass_flag: bool,
    #[serde(default)]
    parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RawJobConfig {
    job_name: String,
    pipeline_name: String,
    #[serde(default)]
    job_info: serde_json::Map<String, Value>,
    #[serde(default)]
    area_name: String,
    #[serde(default)]
    job_seq: i64,
    tasks: IndexMap<String, RawTaskEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ModifyJobParam {
    #[serde(default)]
    source_type: Option<String>,
}

fn build_entry(raw: RawTaskEntry) -> Result<TaskEntry> {
    let raw_params = if raw.parameters.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        raw.parameters
    };
    let params = resolve_module(&raw.module_name, raw_params)?;
    Ok(TaskEntry {
        module_name: raw.module_name,
        bypass_flag: raw.bypass_flag,
        params,
    })
}

fn build_job_config(raw: RawJobConfig) -> Result<JobConfig> {
    let mut slots = TaskSlots::default();
    for (slot, entry) in raw.tasks {
        let entry = build_entry(entry)?;
        match slot.as_str() {
            "eban_in_extractor_task" => slots.eban_in_extractor_task = Some(entry),
            "source_data_extractor_task" => slots.source_data_extractor_task = Some(entry),
            "generate_control_file_task" => slots.generate_control_file_task = Some(entry),
            "file_extractor_task" => slots.file_extractor_task = Some(entry),
            "preprocess_extractor_task" => slots.preprocess_extractor_task = Some(entry),
            "file_decryptor_task" => slots.file_decryptor_task = Some(entry),
            "hsm_encryption_key_file_generator_task" => {
                slots.hsm_encryption_key_file_generator_task = Some(entry)
            }
            "azcopy_data_transfer_task" => slots.azcopy_data_transfer_task = Some(entry),
            other => {
                return Err(DbtapError::ConfigInvalid(format!(
                    "unknown task slot '{other}'"
                )))
            }
        }
    }
    Ok(JobConfig {
        job_name: raw.job_name,
        pipeline_name: raw.pipeline_name,
        job_info: raw.job_info,
        area_name: raw.area_name,
        job_seq: raw.job_seq,
        tasks: slots,
    })
}

/// Recursively merge `overlay` into `base`: maps merge key-wise, everything
/// else is replaced by the overlay value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                        deep_merge(base_value, overlay_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Apply a `modify_job_param` block to the run date. Runs before rendering,
/// so derived date parts see the shifted `pos_dt`.
fn apply_modify_job_param(
    block: &Value,
    job_params: &mut JobParameters,
    holiday_dir: &Path,
) -> Result<()> {
    let rule: ModifyJobParam = serde_json::from_value(block.clone())
        .map_err(|e| DbtapError::ConfigInvalid(format!("invalid modify_job_param: {e}")))?;
    match rule.source_type.as_deref() {
        Some("lpm") => {
            let holidays = dates::load_holidays(holiday_dir)?;
            job_params.pos_dt = dates::offset_business_days(&job_params.pos_dt, &holidays, -1)?;
            Ok(())
        }
        Some(other) => Err(DbtapError::DateRuleUnknown(format!(
            "Input source_type '{other}' is not correct."
        ))),
        None => Ok(()),
    }
}

/// Load, overlay, date-shift, render and validate a job configuration.
///
/// Order of operations is fixed and observable:
/// 1. read the template text,
/// 2. deep-merge every overlay dictionary,
/// 3. evaluate `modify_job_param` against `job_params` (mutates `pos_dt`),
/// 4. render `{{ name }}` placeholders (unknown names kept verbatim),
/// 5. parse and validate into [`JobConfig`].
///
/// Identity fields from the config are copied back onto `job_params`.
pub fn load_job_config(
    job_params: &mut JobParameters,
    overlays: &[Value],
    settings: &Settings,
    holiday_dir: &Path,
) -> Result<JobConfig> {
    let template_text = fs::read_to_string(&job_params.config_file_path)?;

    let mut merged: Value = serde_json::from_str(&template_text)
        .map_err(|e| DbtapError::ConfigInvalid(format!("config is not valid JSON: {e}")))?;
    for overlay in overlays {
        deep_merge(&mut merged, overlay);
    }

    if let Some(block) = merged.get("modify_job_param").cloned() {
        apply_modify_job_param(&block, job_params, holiday_dir)?;
    }

    let mut mapping = DateParts::new(&job_params.pos_dt, &settings.environment)?.mapping();
    mapping.extend(settings.export_map());

    let merged_text = serde_json::to_string_pretty(&merged)?;
    let rendered = render_template(&merged_text, &mapping, Undefined::Keep)?;

    let raw: RawJobConfig = serde_json::from_str(&rendered)
        .map_err(|e| DbtapError::ConfigInvalid(format!("rendered config failed to parse: {e}")))?;
    let config = build_job_config(raw)?;

    job_params.job_name = config.job_name.clone();
    job_params.pipeline_name = config.pipeline_name.clone();
    job_params.area_name = config.area_name.clone();
    job_params.job_seq = config.job_seq;
    job_params.job_info = config.job_info.clone();

    Ok(config)
}
