//! File decryption, in two modes.
//!
//! Passphrase mode drives `gpg` directly with the source system's
//! passphrase. Public-key mode first unlocks the protected passphrase
//! (base64) and imports the private key into an isolated homedir. Both sit
//! behind [`DecryptBackend`] so tests never need the real binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{info, warn};

use crate::config::{GpgDecryptorParams, PgpDecryptorParams};
use crate::errors::{DbtapError, Result};
use crate::settings::Settings;
use crate::shell::CommandRunner;
use crate::task::{describe_file, FileDescriptor};

/// Poll interval of the file-completeness check.
const FILE_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// One decryption strategy: read the encrypted file, write the plaintext.
#[async_trait]
pub trait DecryptBackend: Send + Sync {
    async fn decrypt_file(&self, encrypted: &Path, plaintext: &Path) -> Result<()>;
}

fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    }
}

/// Plaintext path for an encrypted input: `<stem><suffix><ext>` next to it.
///
/// With `strip_wrapper_extension` the outermost extension (the cipher
/// wrapper, e.g. `.gpg`) is dropped first, so `data.txt.gpg` becomes
/// `data<suffix>.txt`; without it `data.pgp` becomes `data<suffix>.pgp`.
pub fn decrypted_path(encrypted: &Path, suffix: &str, strip_wrapper_extension: bool) -> PathBuf {
    let file_name = encrypted
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (stem, ext) = if strip_wrapper_extension {
        let (without_wrapper, _wrapper) = split_extension(&file_name);
        let (stem, inner) = split_extension(without_wrapper);
        (stem.to_string(), inner.to_string())
    } else {
        let (stem, ext) = split_extension(&file_name);
        (stem.to_string(), ext.to_string())
    };

    encrypted
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!("{stem}{suffix}{ext}"))
}

/// Symmetric-mode backend: the passphrase goes straight to `gpg`.
pub struct GpgPassphraseBackend {
    pub passphrase: String,
    pub runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl DecryptBackend for GpgPassphraseBackend {
    async fn decrypt_file(&self, encrypted: &Path, plaintext: &Path) -> Result<()> {
        let args = vec![
            "--batch".to_string(),
            "--yes".to_string(),
            "--pinentry-mode".to_string(),
            "loopback".to_string(),
            "--passphrase".to_string(),
            self.passphrase.clone(),
            "-d".to_string(),
            "-o".to_string(),
            plaintext.to_string_lossy().into_owned(),
            encrypted.to_string_lossy().into_owned(),
        ];
        let result = self.runner.run("gpg", &args, &[]).await?;
        if !result.success() {
            return Err(DbtapError::DecryptInputBad(format!(
                "File {} is not an encrypted file: {}",
                encrypted.display(),
                result.stderr
            )));
        }
        Ok(())
    }
}

/// Public-key backend: the private key is imported into a throwaway homedir
/// that disappears with this value.
pub struct GpgKeyringBackend {
    homedir: tempfile::TempDir,
    passphrase: String,
    runner: Arc<dyn CommandRunner>,
}

impl GpgKeyringBackend {
    pub async fn import(
        key_file_path: &str,
        passphrase: String,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let homedir = tempfile::tempdir()?;
        let args = vec![
            "--homedir".to_string(),
            homedir.path().to_string_lossy().into_owned(),
            "--batch".to_string(),
            "--import".to_string(),
            key_file_path.to_string(),
        ];
        let result = runner.run("gpg", &args, &[]).await?;
        if !result.success() {
            return Err(DbtapError::Shell(format!(
                "failed to import private key {key_file_path}: {}",
                result.stderr
            )));
        }
        Ok(Self {
            homedir,
            passphrase,
            runner,
        })
    }
}

#[async_trait]
impl DecryptBackend for GpgKeyringBackend {
    async fn decrypt_file(&self, encrypted: &Path, plaintext: &Path) -> Result<()> {
        let args = vec![
            "--homedir".to_string(),
            self.homedir.path().to_string_lossy().into_owned(),
            "--batch".to_string(),
            "--yes".to_string(),
            "--pinentry-mode".to_string(),
            "loopback".to_string(),
            "--passphrase".to_string(),
            self.passphrase.clone(),
            "-d".to_string(),
            "-o".to_string(),
            plaintext.to_string_lossy().into_owned(),
            encrypted.to_string_lossy().into_owned(),
        ];
        let result = self.runner.run("gpg", &args, &[]).await?;
        if !result.success() {
            return Err(DbtapError::DecryptInputBad(format!(
                "File {} is not a PGP encrypted file: {}",
                encrypted.display(),
                result.stderr
            )));
        }
        Ok(())
    }
}

/// Recover the cleartext passphrase from its base64-protected form.
pub fn decode_protected_passphrase(pass_enc: &str) -> Result<String> {
    let bytes = BASE64.decode(pass_enc.trim())?;
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}

/// Inputs come from a re-globbed config pattern when set, otherwise from
/// the forwarded descriptor list.
pub fn resolve_inputs(
    source_file_location: &str,
    forwarded: Option<&[FileDescriptor]>,
) -> Result<Vec<String>> {
    if !source_file_location.trim().is_empty() {
        let mut files = Vec::new();
        for entry in glob::glob(source_file_location)? {
            let path = entry?;
            if path.is_file() {
                files.push(path.to_string_lossy().into_owned());
            }
        }
        Ok(files)
    } else {
        forwarded
            .map(|list| list.iter().map(|f| f.location.clone()).collect())
            .ok_or_else(|| {
                DbtapError::PipelineError(
                    "no decrypt inputs: set 'source_file_location' or run a producing stage first"
                        .to_string(),
                )
            })
    }
}

/// Advisory completeness check: poll until no other process holds any of
/// the files open, so a still-writing producer is never raced.
pub async fn wait_until_files_free(files: &[String], runner: &dyn CommandRunner) -> Result<()> {
    info!("Checking file completeness: {}", files.len());
    let mut remaining: Vec<String> = files.to_vec();
    let mut round = 1u32;

    while !remaining.is_empty() {
        let mut busy = Vec::new();
        for file in &remaining {
            let result = runner.run("fuser", &[file.clone()], &[]).await?;
            // fuser exits 0 while some process holds the file
            if result.success() {
                busy.push(file.clone());
            }
        }
        info!("Round {round}: processing remains - {} files", busy.len());
        remaining = busy;
        if !remaining.is_empty() {
            tokio::time::sleep(FILE_CHECK_INTERVAL).await;
        }
        round += 1;
    }

    info!("All files are available to process other tasks");
    Ok(())
}

/// Decrypt every input and return descriptors for the plaintext files.
pub async fn decrypt_files(
    files: &[String],
    backend: &dyn DecryptBackend,
    suffix: &str,
    strip_wrapper_extension: bool,
    cleanup_inputs: bool,
) -> Result<Vec<FileDescriptor>> {
    let mut decrypted = Vec::new();
    for file in files {
        info!("Reading encrypted file: {file}");
        let encrypted = Path::new(file);
        let plaintext = decrypted_path(encrypted, suffix, strip_wrapper_extension);
        backend.decrypt_file(encrypted, &plaintext).await?;
        info!("Decrypted file written to {}", plaintext.display());
        decrypted.push(describe_file(&plaintext)?);

        if cleanup_inputs {
            match fs::remove_file(encrypted) {
                Ok(()) => info!("Cleaned up encrypted file: {file}"),
                Err(err) => warn!("Failed to clean up encrypted file {file}: {err}"),
            }
        }
    }
    Ok(decrypted)
}

/// Public-key mode entry point.
pub async fn run_pgp(
    params: &PgpDecryptorParams,
    settings: &Settings,
    forwarded: Option<&[FileDescriptor]>,
    runner: Arc<dyn CommandRunner>,
) -> Result<Vec<FileDescriptor>> {
    let key = settings.pgp_key(&params.source_system_name)?;
    let system = params.source_system_name.to_uppercase();
    let pass_enc = key.pass_enc.ok_or_else(|| {
        DbtapError::ConfigMissingSecret(format!("Missing ENV 'PGP_PRIVATE_KEY__{system}__PASS_ENC'"))
    })?;
    let key_file_path = key.key_file_path.ok_or_else(|| {
        DbtapError::ConfigMissingSecret(format!(
            "Missing ENV 'PGP_PRIVATE_KEY__{system}__KEY_FILE_PATH'"
        ))
    })?;
    info!("Loaded PGP Key ENV of {}", params.source_system_name);

    let passphrase = decode_protected_passphrase(&pass_enc)?;
    let backend = GpgKeyringBackend::import(&key_file_path, passphrase, runner).await?;

    let files = resolve_inputs(&params.source_file_location, forwarded)?;
    decrypt_files(&files, &backend, &params.file_name_suffix, false, false).await
}

/// Passphrase-only mode entry point.
pub async fn run_gpg(
    params: &GpgDecryptorParams,
    settings: &Settings,
    forwarded: Option<&[FileDescriptor]>,
    runner: Arc<dyn CommandRunner>,
) -> Result<Vec<FileDescriptor>> {
    let key = settings.gpg_key(&params.source_system_name)?;
    let passphrase = key.passphrase.ok_or_else(|| {
        DbtapError::ConfigMissingSecret(format!(
            "Missing ENV 'GPG_PRIVATE_KEY__{}__PASSPHRASE'",
            params.source_system_name.to_uppercase()
        ))
    })?;
    info!("Loaded GPG Key ENV of {}", params.source_system_name);

    let mut files = resolve_inputs(&params.source_file_location, forwarded)?;

    if params.file_complete_check_flag {
        files.retain(|file| Path::new(file).exists());
        if !files.is_empty() {
            wait_until_files_free(&files, runner.as_ref()).await?;
        }
    }

    let backend = GpgPassphraseBackend {
        passphrase,
        runner,
    };
    decrypt_files(
        &files,
        &backend,
        &params.file_name_suffix,
        true,
        params.cleanup_flag,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypted_path_keeps_wrapper_extension() {
        let out = decrypted_path(Path::new("/in/data.pgp"), "_decrypted", false);
        assert_eq!(out, PathBuf::from("/in/data_decrypted.pgp"));
    }

    #[test]
    fn test_decrypted_path_strips_wrapper_extension() {
        let out = decrypted_path(Path::new("/in/data.txt.gpg"), "_decrypted", true);
        assert_eq!(out, PathBuf::from("/in/data_decrypted.txt"));
    }

    #[test]
    fn test_decrypted_path_without_inner_extension() {
        let out = decrypted_path(Path::new("/in/data.gpg"), "_decrypted", true);
        assert_eq!(out, PathBuf::from("/in/data_decrypted"));
    }

    #[test]
    fn test_decode_protected_passphrase() {
        assert_eq!(decode_protected_passphrase("c3dvcmRmaXNoCg==").unwrap(), "swordfish");
    }

    #[test]
    fn test_resolve_inputs_requires_some_source() {
        match resolve_inputs("", None) {
            Err(DbtapError::PipelineError(msg)) => assert!(msg.contains("no decrypt inputs")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_inputs_prefers_forwarded_list() {
        let forwarded = vec![FileDescriptor {
            location: "/in/a.gpg".to_string(),
            size: 1,
            created_at: chrono::Local::now(),
        }];
        let files = resolve_inputs("", Some(&forwarded)).unwrap();
        assert_eq!(files, vec!["/in/a.gpg".to_string()]);
    }
}
