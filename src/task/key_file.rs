//! Key-file generation: pull wrapped keys out of fixed-width payloads,
//! reveal them through the key agent, and re-wrap under a per-date key.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use async_trait::async_trait;
use chrono::Local;
use indexmap::IndexSet;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::templating::{render_template, Undefined};
use crate::config::{FixedWidthField, JobParameters, KeyFileGeneratorParams};
use crate::errors::{DbtapError, Result};
use crate::settings::HsmAgentSettings;
use crate::shell::CommandRunner;
use crate::task::{describe_file, FileDescriptor};
use crate::writer::write_delimited;

const BLOCK_SIZE: usize = 16;

/// Reveals a wrapped source-system key into its clear form.
#[async_trait]
pub trait KeyAgent: Send + Sync {
    async fn reveal(&self, ciphertext: &str) -> Result<String>;
}

/// Production agent: the deployment's Java HSM client, stdout is the key.
pub struct HsmKeyAgent {
    pub settings: HsmAgentSettings,
    pub runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl KeyAgent for HsmKeyAgent {
    async fn reveal(&self, ciphertext: &str) -> Result<String> {
        let args = vec![
            "-cp".to_string(),
            self.settings.java_class_path.clone(),
            self.settings.java_class_name.clone(),
            ciphertext.to_string(),
            self.settings.host.clone(),
            self.settings.port.clone(),
            self.settings.dpk.clone(),
        ];
        let result = self.runner.run("java", &args, &[]).await?;
        if !result.success() {
            return Err(DbtapError::KeyServerError(format!(
                "HSM service error: exit_code {}: {}",
                result.exit_code, result.stderr
            )));
        }
        let clear_key = result.stdout.trim().to_string();
        if clear_key.is_empty() {
            return Err(DbtapError::KeyServerError(
                "HSM service returned an empty key".to_string(),
            ));
        }
        Ok(clear_key)
    }
}

/// Reads records from fixed-width text per the declared field mapping.
pub struct FixedWidthReader {
    fields: Vec<FixedWidthField>,
}

impl FixedWidthReader {
    pub fn new(fields: &[FixedWidthField]) -> Self {
        Self {
            fields: fields.to_vec(),
        }
    }

    /// Slice one line into trimmed field values. Offsets are 1-based; short
    /// lines yield empty values rather than failing.
    pub fn parse_line(&self, line: &str) -> Vec<String> {
        let bytes = line.as_bytes();
        self.fields
            .iter()
            .map(|field| {
                let start = field.offset.saturating_sub(1).min(bytes.len());
                let end = (start + field.size).min(bytes.len());
                String::from_utf8_lossy(&bytes[start..end]).trim().to_string()
            })
            .collect()
    }

    /// Read every payload file, skipping `header_rows` leading and
    /// `footer_rows` trailing lines per file.
    pub fn read_rows(
        &self,
        files: &[String],
        header_rows: usize,
        footer_rows: usize,
    ) -> Result<Vec<Vec<String>>> {
        let mut rows = Vec::new();
        for file in files {
            let content = fs::read_to_string(file)?;
            let lines: Vec<&str> = content.lines().collect();
            let body_end = lines.len().saturating_sub(footer_rows);
            for line in lines.iter().take(body_end).skip(header_rows) {
                rows.push(self.parse_line(line));
            }
        }
        Ok(rows)
    }
}

/// Pull the wrapped key(s) out of the parsed rows.
///
/// The `header` variant reads the key cell of the first row; the `body`
/// variant collects the distinct first-column values across all rows,
/// preserving first-seen order.
pub fn extract_keys(rows: &[Vec<String>], section: &str) -> Vec<String> {
    match section {
        "header" => rows
            .first()
            .and_then(|row| row.first())
            .filter(|value| !value.is_empty())
            .map(|value| vec![value.clone()])
            .unwrap_or_default(),
        "body" => {
            let mut seen = IndexSet::new();
            for row in rows {
                if let Some(value) = row.first() {
                    if !value.is_empty() {
                        seen.insert(value.clone());
                    }
                }
            }
            seen.into_iter().collect()
        }
        _ => Vec::new(),
    }
}

/// Per-date wrapping key: the SHA-256 digest of the run date.
pub fn wrapping_key(pos_dt: &str) -> [u8; 32] {
    Sha256::digest(pos_dt.as_bytes()).into()
}

/// Re-wrap a clear key under the per-date key with AES-256 in deterministic
/// block mode, hex-encoded.
pub fn wrap_key(clear_key: &str, pos_dt: &str) -> Result<String> {
    let plaintext = clear_key.as_bytes();
    if plaintext.is_empty() || plaintext.len() % BLOCK_SIZE != 0 {
        return Err(DbtapError::KeyServerError(format!(
            "clear key length {} is not a positive multiple of the cipher block size",
            plaintext.len()
        )));
    }

    let key = wrapping_key(pos_dt);
    let cipher = Aes256::new(GenericArray::from_slice(&key));

    let mut ciphertext = Vec::with_capacity(plaintext.len());
    for chunk in plaintext.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.encrypt_block(&mut block);
        ciphertext.extend_from_slice(&block);
    }
    Ok(hex::encode(ciphertext))
}

/// Render the key-mapping rows. `keys` pairs each source key with its
/// re-wrapped form.
pub fn key_file_rows(
    pos_dt: &str,
    generated_on: &str,
    keys: &[(String, String)],
    data_file_name: &str,
    section: &str,
) -> Vec<Vec<String>> {
    keys.iter()
        .map(|(original, wrapped)| {
            if section == "body" {
                vec![
                    pos_dt.to_string(),
                    generated_on.to_string(),
                    wrapped.clone(),
                    original.clone(),
                    data_file_name.to_string(),
                ]
            } else {
                vec![
                    pos_dt.to_string(),
                    generated_on.to_string(),
                    wrapped.clone(),
                    data_file_name.to_string(),
                ]
            }
        })
        .collect()
}

fn resolve_inputs(
    params: &KeyFileGeneratorParams,
    forwarded: Option<&[FileDescriptor]>,
) -> Result<(Vec<String>, Vec<FileDescriptor>)> {
    if !params.source_file_location.trim().is_empty() {
        let rendered = render_template(
            &params.source_file_location,
            &params.file_name_format.mapping(),
            Undefined::Keep,
        )?;
        let mut files = Vec::new();
        for entry in glob::glob(&rendered)? {
            let path = entry?;
            let is_key_file = path
                .extension()
                .map(|ext| ext == params.file_extension.as_str())
                .unwrap_or(false);
            if path.is_file() && !is_key_file {
                files.push(path.to_string_lossy().into_owned());
            }
        }
        let infos = files.iter().map(describe_file).collect::<Result<Vec<_>>>()?;
        Ok((files, infos))
    } else {
        let list = forwarded.filter(|list| !list.is_empty()).ok_or_else(|| {
            DbtapError::PipelineError(
                "file list from the previous task is empty; check the preceding stages".to_string(),
            )
        })?;
        Ok((
            list.iter().map(|f| f.location.clone()).collect(),
            list.to_vec(),
        ))
    }
}

/// Generate the key-mapping file and append it to the forwarded list.
pub async fn run(
    params: &KeyFileGeneratorParams,
    job: &JobParameters,
    forwarded: Option<&[FileDescriptor]>,
    agent: &dyn KeyAgent,
) -> Result<Vec<FileDescriptor>> {
    let (files, mut file_infos) = resolve_inputs(params, forwarded)?;
    if files.is_empty() {
        return Err(DbtapError::ConfigInvalid(
            "Please check 'source_file_location' in config".to_string(),
        ));
    }
    info!("List of file location path = {files:?}.");

    let (section, fields) = params
        .length_mapping_config
        .iter()
        .next()
        .ok_or_else(|| DbtapError::ConfigInvalid("length_mapping_config is empty".to_string()))?;
    let section = section.as_str();
    if section != "header" && section != "body" {
        return Err(DbtapError::ConfigInvalid(format!(
            "length_mapping_config section must be 'header' or 'body', got '{section}'"
        )));
    }

    let reader = FixedWidthReader::new(fields);
    let rows = reader.read_rows(
        &files,
        params.number_of_row_header,
        params.number_of_row_footer,
    )?;
    let encrypted_keys = extract_keys(&rows, section);
    info!("Number of HSM key = {}.", encrypted_keys.len());

    info!("Get clear key from HSM service");
    let mut key_pairs = Vec::new();
    for key in &encrypted_keys {
        let clear_key = agent.reveal(key).await?;
        let wrapped = wrap_key(&clear_key, &job.pos_dt)?;
        key_pairs.push((key.clone(), wrapped));
    }

    let full_file_name = render_template(
        &params.full_file_name,
        &params.file_name_format.mapping(),
        Undefined::Keep,
    )?;
    let directory = Path::new(&files[0]).parent().unwrap_or_else(|| Path::new(""));
    let path = directory.join(format!("{}.{}", full_file_name, params.file_extension));

    let generated_on = Local::now().format("%Y-%m-%d").to_string();
    let data = key_file_rows(&job.pos_dt, &generated_on, &key_pairs, &full_file_name, section);

    // A key file left over from a prior run must not accumulate rows
    let _ = fs::remove_file(&path);
    write_delimited(
        &path,
        &params.header_columns,
        data,
        &params.write_property.to_policy()?,
        &params.file_option.to_policy()?,
    )?;
    info!("Key file is generated.");

    file_infos.push(describe_file(&path)?);
    Ok(file_infos)
}
