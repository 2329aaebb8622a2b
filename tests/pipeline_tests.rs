use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use dbtap::config::{load_job_config, JobParameters, KeyFileGeneratorParams};
use dbtap::pipeline::Pipeline;
use dbtap::settings::Settings;
use dbtap::shell::{CommandResult, CommandRunner};
use dbtap::task::key_file::{self, KeyAgent};
use dbtap::{DbtapError, Result};

/// Runner that fakes the external binaries a pipeline touches: `sh`
/// succeeds, `gpg` copies ciphertext to plaintext, everything else fails.
struct FakeRunner {
    programs: Mutex<Vec<String>>,
}

impl FakeRunner {
    fn new() -> Self {
        Self {
            programs: Mutex::new(Vec::new()),
        }
    }

    fn programs(&self) -> Vec<String> {
        self.programs.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _envs: &[(String, String)],
    ) -> Result<CommandResult> {
        self.programs.lock().unwrap().push(program.to_string());
        match program {
            "sh" => Ok(CommandResult {
                stdout: "preprocess ok".to_string(),
                stderr: String::new(),
                exit_code: 0,
            }),
            "gpg" => {
                // gpg ... -d -o <plaintext> <encrypted>
                let output = args
                    .iter()
                    .position(|a| a == "-o")
                    .map(|i| args[i + 1].clone())
                    .expect("gpg invocation without -o");
                let input = args.last().expect("gpg invocation without input");
                fs::copy(input, output)?;
                Ok(CommandResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                })
            }
            other => Ok(CommandResult {
                stdout: String::new(),
                stderr: format!("unexpected program {other}"),
                exit_code: 127,
            }),
        }
    }
}

/// Agent that answers every ciphertext with one fixed 32-byte clear key.
struct FakeAgent {
    revealed: Mutex<Vec<String>>,
}

impl FakeAgent {
    fn new() -> Self {
        Self {
            revealed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl KeyAgent for FakeAgent {
    async fn reveal(&self, ciphertext: &str) -> Result<String> {
        self.revealed.lock().unwrap().push(ciphertext.to_string());
        Ok("0123456789abcdef0123456789abcdef".to_string())
    }
}

fn settings() -> Settings {
    Settings::from_vars(
        [(
            "GPG_PRIVATE_KEY__BILLING__PASSPHRASE".to_string(),
            "swordfish".to_string(),
        )]
        .into_iter(),
    )
}

fn write_config(dir: &TempDir, value: &serde_json::Value) -> String {
    let path = dir.path().join("job.json");
    fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path.to_string_lossy().into_owned()
}

fn load(
    dir: &TempDir,
    value: &serde_json::Value,
    run_only_task: Option<Vec<String>>,
) -> (dbtap::config::JobConfig, JobParameters) {
    let mut params = JobParameters {
        project: "mdp".to_string(),
        pos_dt: "2024-02-28".to_string(),
        config_file_path: write_config(dir, value),
        run_only_task,
        ..Default::default()
    };
    let config = load_job_config(&mut params, &[], &settings(), dir.path()).unwrap();
    (config, params)
}

#[tokio::test]
async fn test_empty_pipeline_succeeds_with_default_values() {
    let dir = TempDir::new().unwrap();
    let value = json!({
        "job_name": "noop",
        "pipeline_name": "extraction",
        "job_info": {},
        "tasks": {}
    });
    let (config, params) = load(&dir, &value, None);

    let env = settings();
    let runner = Arc::new(FakeRunner::new());
    let mut pipeline = Pipeline::new(&config, &params, &env, runner.clone());
    pipeline.execute().await.unwrap();

    assert!(pipeline.executed_values.extract_file_paths.is_none());
    assert!(pipeline.executed_values.target_file_path.is_none());
    assert!(runner.programs().is_empty());
}

#[tokio::test]
async fn test_bypassed_stage_is_skipped() {
    let dir = TempDir::new().unwrap();
    let value = json!({
        "job_name": "bypassed",
        "pipeline_name": "extraction",
        "job_info": {},
        "tasks": {
            "preprocess_extractor_task": {
                "module_name": "submit_command_script",
                "bypass_flag": true,
                "parameters": {"shell_command": "exit 1"}
            }
        }
    });
    let (config, params) = load(&dir, &value, None);

    let env = settings();
    let runner = Arc::new(FakeRunner::new());
    let mut pipeline = Pipeline::new(&config, &params, &env, runner.clone());
    pipeline.execute().await.unwrap();
    assert!(runner.programs().is_empty());
}

#[tokio::test]
async fn test_run_only_transfer_without_inputs_fails_clearly() {
    let dir = TempDir::new().unwrap();
    let value = json!({
        "job_name": "rerun",
        "pipeline_name": "extraction",
        "job_info": {},
        "tasks": {
            "preprocess_extractor_task": {
                "module_name": "submit_command_script",
                "parameters": {"shell_command": "true"}
            },
            "azcopy_data_transfer_task": {
                "module_name": "azcopy_data_transfer",
                "parameters": {
                    "azcopy_command": "cp",
                    "target": {
                        "type": "ADLSLocation",
                        "account_name": "acct",
                        "container_name": "inbound",
                        "sas_token": "sv=1",
                        "filepath": "landing"
                    }
                }
            }
        }
    });
    let (config, params) = load(
        &dir,
        &value,
        Some(vec!["azcopy_data_transfer_task".to_string()]),
    );

    let env = settings();
    let runner = Arc::new(FakeRunner::new());
    let mut pipeline = Pipeline::new(&config, &params, &env, runner.clone());
    match pipeline.execute().await {
        Err(DbtapError::ConfigInvalid(msg)) => assert!(msg.contains("Source parameter")),
        other => panic!("unexpected: {other:?}"),
    }
    // The preprocess slot was excluded by the run-only filter
    assert!(runner.programs().is_empty());
}

#[tokio::test]
async fn test_decrypt_and_key_file_stages_chain() {
    let dir = TempDir::new().unwrap();
    let payload_dir = dir.path().join("payloads");
    fs::create_dir_all(&payload_dir).unwrap();
    // Fixed-width payloads: 8-char key cell then data
    fs::write(payload_dir.join("cust_a.txt.gpg"), "ENCKEY01DATA\nENCKEY01MORE\n").unwrap();
    fs::write(payload_dir.join("cust_b.txt.gpg"), "ENCKEY02DATA\n").unwrap();

    let glob_pattern = format!("{}/cust_*.gpg", payload_dir.to_string_lossy());
    let value = json!({
        "job_name": "chained",
        "pipeline_name": "extraction",
        "job_info": {},
        "tasks": {
            "preprocess_extractor_task": {
                "module_name": "submit_command_script",
                "parameters": {"shell_command": "echo ready"}
            },
            "file_decryptor_task": {
                "module_name": "gpg_file_decryptor",
                "parameters": {
                    "source_system_name": "billing",
                    "source_file_location": glob_pattern
                }
            },
            "hsm_encryption_key_file_generator_task": {
                "module_name": "hsm_key_file_generator",
                "parameters": {
                    "length_mapping_config": {
                        "body": [
                            {"field_name": "hsm_key", "offset": 1, "size": 8, "type": "STRING", "is_encrypted": true},
                            {"field_name": "payload", "offset": 9, "size": 4, "type": "STRING"}
                        ]
                    },
                    "header_columns": ["date_of_key", "date_of_generated_key", "encrypted_key", "hsm_key", "data_file_name"],
                    "file_name_format": {
                        "base_file_name": "cust_keys",
                        "date_suffix": "20240228"
                    },
                    "full_file_name": "{{ base_file_name }}_{{ date_suffix }}",
                    "write_property": {"header": true, "option": {"delimiter": "|"}}
                }
            }
        }
    });
    let (config, params) = load(&dir, &value, None);

    let env = settings();
    let runner = Arc::new(FakeRunner::new());
    let agent = Arc::new(FakeAgent::new());
    let mut pipeline = Pipeline::new(&config, &params, &env, runner.clone())
        .with_key_agent(agent.clone());
    pipeline.execute().await.unwrap();

    // Decrypted siblings exist next to the payloads
    assert!(payload_dir.join("cust_a_decrypted.txt").exists());
    assert!(payload_dir.join("cust_b_decrypted.txt").exists());

    // The key file holds one row per distinct key, under the declared header
    let key_path = payload_dir.join("cust_keys_20240228.key");
    let content = fs::read_to_string(&key_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines[0],
        "date_of_key|date_of_generated_key|encrypted_key|hsm_key|data_file_name"
    );
    assert!(lines[1].starts_with("2024-02-28|"));
    assert!(lines[1].contains("|ENCKEY01|"));
    assert!(lines[2].contains("|ENCKEY02|"));

    // Both distinct ciphertexts went to the agent, in first-seen order
    assert_eq!(
        agent.revealed.lock().unwrap().clone(),
        vec!["ENCKEY01".to_string(), "ENCKEY02".to_string()]
    );

    let programs = runner.programs();
    assert!(programs.contains(&"sh".to_string()));
    assert_eq!(programs.iter().filter(|p| *p == "gpg").count(), 2);
}

#[tokio::test]
async fn test_key_file_generator_body_mode_counts_distinct_keys() {
    let dir = TempDir::new().unwrap();
    // Eight payload files, one distinct key each
    let mut paths: Vec<PathBuf> = Vec::new();
    for i in 0..8 {
        let path = dir.path().join(format!("plain_{i}.txt"));
        fs::write(&path, format!("KEY-{i:03}XPAYLOAD\n")).unwrap();
        paths.push(path);
    }

    let params: KeyFileGeneratorParams = serde_json::from_value(json!({
        "source_file_location": format!("{}/plain_*.txt", dir.path().to_string_lossy()),
        "length_mapping_config": {
            "body": [
                {"field_name": "hsm_key", "offset": 1, "size": 8, "type": "STRING", "is_encrypted": true}
            ]
        },
        "header_columns": ["date_of_key", "date_of_generated_key", "encrypted_key", "hsm_key", "data_file_name"],
        "file_name_format": {"base_file_name": "keys", "date_suffix": "20240228"},
        "full_file_name": "{{ base_file_name }}_{{ date_suffix }}",
        "write_property": {"header": true, "option": {"delimiter": "|"}}
    }))
    .unwrap();

    let job = JobParameters {
        pos_dt: "2024-02-28".to_string(),
        ..Default::default()
    };
    let agent = FakeAgent::new();
    let file_infos = key_file::run(&params, &job, None, &agent).await.unwrap();

    // Eight inputs plus the generated key file
    assert_eq!(file_infos.len(), 9);
    let key_file_path = &file_infos.last().unwrap().location;
    assert!(key_file_path.ends_with("keys_20240228.key"));

    let content = fs::read_to_string(key_file_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 9);
    for line in &lines[1..] {
        assert_eq!(line.split('|').count(), 5);
    }
}
