//! Source data extraction: query, partition, write numbered part files.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::info;

use crate::config::templating::{render_template, DateParts, Undefined};
use crate::config::{
    DocumentExtractorParams, FileNameFormat, FileOption, JobParameters, RelationalExtractorParams,
    WriteProperty,
};
use crate::errors::{DbtapError, Result};
use crate::settings::Settings;
use crate::source::document::DocumentSource;
use crate::source::relational::RelationalSource;
use crate::source::RecordSource;
use crate::task::{describe_file, FileDescriptor};
use crate::writer::{write_delimited, write_json_array, OpenPolicy, WritePolicy};

/// Driver-independent view of one extraction, shared by both source kinds.
pub struct ExtractSpec<'a> {
    pub query: Option<&'a str>,
    pub query_file_path: Option<&'a str>,
    pub extract_file_location: &'a str,
    pub batch_size: usize,
    pub allow_zero_record: bool,
    pub file_name_format: &'a FileNameFormat,
    pub full_file_name: &'a str,
    pub file_extension: &'a str,
    pub file_option: &'a FileOption,
    pub write_property: &'a WriteProperty,
}

impl<'a> From<&'a RelationalExtractorParams> for ExtractSpec<'a> {
    fn from(params: &'a RelationalExtractorParams) -> Self {
        Self {
            query: params.query.as_deref(),
            query_file_path: params.sql_file_path.as_deref(),
            extract_file_location: &params.extract_file_location,
            batch_size: params.batch_size,
            allow_zero_record: params.allow_zero_record,
            file_name_format: &params.file_name_format,
            full_file_name: &params.full_file_name,
            file_extension: &params.file_extension,
            file_option: &params.file_option,
            write_property: &params.write_property,
        }
    }
}

impl<'a> From<&'a DocumentExtractorParams> for ExtractSpec<'a> {
    fn from(params: &'a DocumentExtractorParams) -> Self {
        Self {
            query: params.query.as_deref(),
            query_file_path: params.json_file_path.as_deref(),
            extract_file_location: &params.extract_file_location,
            batch_size: params.batch_size,
            allow_zero_record: params.allow_zero_record,
            file_name_format: &params.file_name_format,
            full_file_name: &params.full_file_name,
            file_extension: &params.file_extension,
            file_option: &params.file_option,
            write_property: &params.write_property,
        }
    }
}

/// Load the query text: the literal from the config, or the referenced file
/// rendered against the run's date parts.
pub fn resolve_query(
    query: Option<&str>,
    query_file_path: Option<&str>,
    pos_dt: &str,
    env: &str,
) -> Result<String> {
    match (query, query_file_path) {
        (Some(text), _) => Ok(text.to_string()),
        (None, Some(path)) => {
            let template = fs::read_to_string(path)?;
            let mapping = DateParts::new(pos_dt, env)?.mapping();
            render_template(&template, &mapping, Undefined::Keep)
        }
        (None, None) => Err(DbtapError::ConfigInvalid(
            "Either 'query' or a query file path is required.".to_string(),
        )),
    }
}

/// Substitute the sequential part index into a rendered file name.
pub fn name_with_part(full_file_name: &str, part_number: &str) -> Result<String> {
    let mut mapping = IndexMap::new();
    mapping.insert("part_number".to_string(), part_number.to_string());
    render_template(full_file_name, &mapping, Undefined::Keep)
}

/// Glob for every prior output of this job and date: the `part_number` slot
/// widens to `*`, the extension widens to `.*` (data and ctl siblings), and
/// every other glob metacharacter in the rendered name is escaped.
pub fn leftover_pattern(dir: &str, full_file_name: &str) -> Result<String> {
    // A char that can't appear in a rendered file name marks the part slot
    // through escaping.
    const PART_SENTINEL: char = '\u{1}';
    let rendered = name_with_part(full_file_name, &PART_SENTINEL.to_string())?;
    let escaped = glob::Pattern::escape(&rendered).replace(PART_SENTINEL, "*");
    Ok(format!("{}{}.*", glob::Pattern::escape(dir), escaped))
}

/// Remove every file matching `pattern`; returns the removed paths.
pub fn remove_leftovers(pattern: &str) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for entry in glob::glob(pattern)? {
        let path = entry?;
        if path.is_file() {
            fs::remove_file(&path)?;
            removed.push(path.to_string_lossy().into_owned());
        }
    }
    Ok(removed)
}

fn write_partition(
    path: &Path,
    result: &crate::source::ResultSet,
    partition: &[crate::source::Record],
    extension: &str,
    write_policy: &WritePolicy,
    open_policy: &OpenPolicy,
) -> Result<()> {
    if extension == "json" {
        let docs: Vec<Value> = partition
            .iter()
            .map(|record| Value::Object(record.clone()))
            .collect();
        write_json_array(path, &docs)
    } else {
        write_delimited(
            path,
            &result.columns,
            partition.iter().map(|record| result.cells(record)),
            write_policy,
            open_policy,
        )
    }
}

/// Core extraction over any record source. Testable without a live driver.
pub async fn run_with_source(
    source: &dyn RecordSource,
    spec: &ExtractSpec<'_>,
    pos_dt: &str,
    env: &str,
) -> Result<Vec<FileDescriptor>> {
    let query = resolve_query(spec.query, spec.query_file_path, pos_dt, env)?;

    let rendered_name = render_template(
        spec.full_file_name,
        &spec.file_name_format.mapping(),
        Undefined::Keep,
    )?;

    let pattern = leftover_pattern(spec.extract_file_location, &rendered_name)?;
    info!("Searching leftover files with pattern {pattern}");
    let removed = remove_leftovers(&pattern)?;
    if !removed.is_empty() {
        info!("Removed existing leftover files {removed:?}");
    }

    info!("Extracting data using query: {query}");
    let result = source.execute(&query).await?;

    let write_policy = spec.write_property.to_policy()?;
    let open_policy = spec.file_option.to_policy()?;

    let mut file_infos = Vec::new();
    for (part_number, partition) in result.partitions(spec.batch_size).enumerate() {
        let name = name_with_part(&rendered_name, &part_number.to_string())?;
        let path_string = format!(
            "{}{}.{}",
            spec.extract_file_location, name, spec.file_extension
        );
        let path = Path::new(&path_string);
        info!("Writing {path_string}");
        write_partition(
            path,
            &result,
            partition,
            spec.file_extension,
            &write_policy,
            &open_policy,
        )?;
        file_infos.push(describe_file(path)?);
    }

    if file_infos.is_empty() {
        if spec.allow_zero_record {
            let name = name_with_part(&rendered_name, "0")?;
            let path_string = format!(
                "{}{}.{}",
                spec.extract_file_location, name, spec.file_extension
            );
            info!("Writing {path_string} with zero record.");
            write_partition(
                Path::new(&path_string),
                &result,
                &[],
                spec.file_extension,
                &write_policy,
                &open_policy,
            )?;
            file_infos.push(describe_file(&path_string)?);
        } else {
            return Err(DbtapError::NoRecords(
                "Found zero record. No writing to file as the allow_zero_record flag is set to False."
                    .to_string(),
            ));
        }
    }

    Ok(file_infos)
}

/// Extraction against a relational connection.
pub async fn run_relational(
    params: &RelationalExtractorParams,
    job: &JobParameters,
    settings: &Settings,
) -> Result<Vec<FileDescriptor>> {
    let profile = settings.connection_profile(&params.connection_name)?;
    let source = RelationalSource::connect(&profile).await?;
    let result = run_with_source(
        &source,
        &ExtractSpec::from(params),
        &job.pos_dt,
        &settings.environment,
    )
    .await;
    source.close().await;
    result
}

/// Extraction against a document collection.
pub async fn run_document(
    params: &DocumentExtractorParams,
    job: &JobParameters,
    settings: &Settings,
) -> Result<Vec<FileDescriptor>> {
    let profile = settings.connection_profile(&params.connection_name)?;
    let source = DocumentSource::connect(&profile).await?;
    let result = run_with_source(
        &source,
        &ExtractSpec::from(params),
        &job.pos_dt,
        &settings.environment,
    )
    .await;
    source.close().await;
    result
}
