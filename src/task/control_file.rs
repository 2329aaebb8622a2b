//! Control-file generation: one summary row describing the extraction.

use std::path::Path;

use tracing::info;

use crate::config::templating::{render_template, Undefined};
use crate::config::{ControlFileParams, JobParameters};
use crate::errors::Result;
use crate::settings::Settings;
use crate::source::document::DocumentSource;
use crate::source::relational::RelationalSource;
use crate::source::RecordSource;
use crate::task::extract::resolve_query;
use crate::writer::write_delimited;

/// Join the declared header and the first result row into the two-line
/// `.ctl` body. Arity between the two lines is the job author's contract.
pub fn render_control_details(header_columns: &[String], first_row: Option<Vec<String>>) -> String {
    let column_line = header_columns.join("|");
    let data_line = first_row.map(|cells| cells.join("|")).unwrap_or_default();
    format!("{column_line}\n{data_line}")
}

/// Run the control query and write the `.ctl` sidecar.
///
/// Returns the file path and the rendered content string, which the
/// executor keeps for the operation log.
pub async fn run_with_source(
    source: &dyn RecordSource,
    params: &ControlFileParams,
    pos_dt: &str,
    env: &str,
) -> Result<(String, String)> {
    let query = resolve_query(
        params.query.as_deref(),
        params.sql_file_path.as_deref(),
        pos_dt,
        env,
    )?;

    let rendered_name = render_template(
        &params.full_file_name,
        &params.file_name_format.mapping(),
        Undefined::Keep,
    )?;
    let path_string = format!(
        "{}{}.{}",
        params.extract_file_location, rendered_name, params.file_extension
    );

    info!("Extracting control data using query: {query}");
    let result = source.execute(&query).await?;

    let header_columns = params.header_columns.clone().unwrap_or_default();
    write_delimited(
        Path::new(&path_string),
        &header_columns,
        result.records.iter().map(|record| result.cells(record)),
        &params.write_property.to_policy()?,
        &params.file_option.to_policy()?,
    )?;
    info!("Write {path_string} completed.");

    let first_row = result.records.first().map(|record| result.cells(record));
    let details = render_control_details(&header_columns, first_row);
    Ok((path_string, details))
}

pub async fn run_relational(
    params: &ControlFileParams,
    job: &JobParameters,
    settings: &Settings,
) -> Result<(String, String)> {
    let profile = settings.connection_profile(&params.connection_name)?;
    let source = RelationalSource::connect(&profile).await?;
    let result = run_with_source(&source, params, &job.pos_dt, &settings.environment).await;
    source.close().await;
    result
}

pub async fn run_document(
    params: &ControlFileParams,
    job: &JobParameters,
    settings: &Settings,
) -> Result<(String, String)> {
    let profile = settings.connection_profile(&params.connection_name)?;
    let source = DocumentSource::connect(&profile).await?;
    let result = run_with_source(&source, params, &job.pos_dt, &settings.environment).await;
    source.close().await;
    result
}
