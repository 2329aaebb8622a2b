use std::collections::HashMap;

use indexmap::IndexMap;

use crate::errors::{DbtapError, Result};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 180;

/// Database kinds resolvable from a connection catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    SqlServer,
    OracleDb,
    Db2,
    MariaDb,
    MongoDb,
    MongoDbSrv,
}

impl SourceKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "sqlserver" => Some(Self::SqlServer),
            "oracledb" => Some(Self::OracleDb),
            "db2" => Some(Self::Db2),
            "mariadb" => Some(Self::MariaDb),
            "mongodb" => Some(Self::MongoDb),
            "mongodbsrv" => Some(Self::MongoDbSrv),
            _ => None,
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, Self::MongoDb | Self::MongoDbSrv)
    }
}

/// Connection settings for one named source, resolved fresh per task.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    pub kind: SourceKind,
    pub username: String,
    pub password: String,
    pub database: String,
    pub server: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub schemaname: Option<String>,
    pub securitymechanism: Option<String>,
    pub collection: Option<String>,
}

/// Private-key material for one source system.
///
/// Public-key mode carries `pass_enc` (base64-protected passphrase) plus
/// `key_file_path`; symmetric mode carries only `passphrase`.
#[derive(Debug, Clone, Default)]
pub struct KeyProfile {
    pub pass_enc: Option<String>,
    pub key_file_path: Option<String>,
    pub passphrase: Option<String>,
}

/// One inbound blob-storage location from the environment.
#[derive(Debug, Clone, Default)]
pub struct StorageLocation {
    pub account_name: String,
    pub container_name: String,
    pub sas_token: String,
    pub filepath: String,
}

/// Key-agent connection settings.
#[derive(Debug, Clone)]
pub struct HsmAgentSettings {
    pub host: String,
    pub port: String,
    pub dpk: String,
    pub java_class_path: String,
    pub java_class_name: String,
}

/// One snapshot of the process environment, taken at startup and passed by
/// reference everywhere. Nothing below re-reads `std::env` afterwards.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub environment: String,
    pub project: String,
    connections: HashMap<String, HashMap<String, String>>,
    pgp_keys: HashMap<String, HashMap<String, String>>,
    gpg_keys: HashMap<String, HashMap<String, String>>,
    storage: HashMap<String, HashMap<String, String>>,
    hsm: HashMap<String, String>,
}

const STORAGE_GROUPS: &[&str] = &["MDP_INBND", "OIH_INBND", "LOCAL_STORAGE"];
const HSM_KEYS: &[&str] = &[
    "HSM_HOST",
    "HSM_PORT",
    "HSM_DPK",
    "HSM_JAVA_CLASS_PATH",
    "HSM_JAVA_CLASS_NAME",
];

impl Settings {
    /// Snapshot the current process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build a snapshot from an explicit variable iterator (tests).
    pub fn from_vars(vars: impl Iterator<Item = (String, String)>) -> Self {
        let mut settings = Settings {
            environment: "dev".to_string(),
            project: "mdp".to_string(),
            ..Default::default()
        };

        for (key, value) in vars {
            let upper = key.to_uppercase();
            if upper == "ENVIRONMENT" {
                settings.environment = value;
            } else if upper == "PROJECT" {
                settings.project = value.to_lowercase();
            } else if let Some(rest) = upper.strip_prefix("CONNECTION_INFO__") {
                insert_catalog_entry(&mut settings.connections, rest, value);
            } else if let Some(rest) = upper.strip_prefix("PGP_PRIVATE_KEY__") {
                insert_catalog_entry(&mut settings.pgp_keys, rest, value);
            } else if let Some(rest) = upper.strip_prefix("GPG_PRIVATE_KEY__") {
                insert_catalog_entry(&mut settings.gpg_keys, rest, value);
            } else if HSM_KEYS.contains(&upper.as_str()) {
                settings.hsm.insert(upper.to_lowercase(), value);
            } else if let Some(group) = STORAGE_GROUPS
                .iter()
                .find(|g| upper.starts_with(&format!("{g}__")))
            {
                let field = upper[group.len() + 2..].to_lowercase();
                settings
                    .storage
                    .entry(group.to_lowercase())
                    .or_default()
                    .insert(field, value);
            }
        }

        settings
    }

    /// Resolve a named connection into a typed profile.
    pub fn connection_profile(&self, name: &str) -> Result<ConnectionProfile> {
        let entry = self.connections.get(&name.to_lowercase()).ok_or_else(|| {
            DbtapError::ConfigMissingSecret(format!("connection '{name}' not found in environment"))
        })?;

        let dbtype = entry.get("dbtype").ok_or_else(|| {
            DbtapError::ConfigInvalid(format!("dbtype not defined for connection '{name}'"))
        })?;
        let kind = SourceKind::parse(dbtype).ok_or_else(|| {
            DbtapError::ConfigInvalid(format!(
                "Unsupported dbtype '{dbtype}' for connection '{name}'"
            ))
        })?;

        let required = |field: &str| -> Result<String> {
            entry.get(field).cloned().ok_or_else(|| {
                DbtapError::ConfigInvalid(format!("{field} not defined for connection '{name}'"))
            })
        };

        Ok(ConnectionProfile {
            kind,
            username: required("username")?,
            password: required("password")?,
            database: required("database")?,
            server: entry.get("server").cloned().unwrap_or_default(),
            port: entry
                .get("port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            timeout_secs: entry
                .get("timeout")
                .and_then(|t| t.parse().ok())
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            schemaname: entry.get("schemaname").cloned(),
            securitymechanism: entry.get("securitymechanism").cloned(),
            collection: entry.get("collection").cloned(),
        })
    }

    /// Key profile for the public-key decryptor.
    pub fn pgp_key(&self, source_system: &str) -> Result<KeyProfile> {
        let entry = self
            .pgp_keys
            .get(&source_system.to_lowercase())
            .ok_or_else(|| {
                DbtapError::ConfigMissingSecret(format!(
                    "Missing ENV 'PGP_PRIVATE_KEY__{}__*'",
                    source_system.to_uppercase()
                ))
            })?;
        Ok(KeyProfile {
            pass_enc: entry.get("pass_enc").cloned(),
            key_file_path: entry.get("key_file_path").cloned(),
            passphrase: None,
        })
    }

    /// Key profile for the passphrase-only decryptor.
    pub fn gpg_key(&self, source_system: &str) -> Result<KeyProfile> {
        let entry = self
            .gpg_keys
            .get(&source_system.to_lowercase())
            .ok_or_else(|| {
                DbtapError::ConfigMissingSecret(format!(
                    "Missing ENV 'GPG_PRIVATE_KEY__{}__PASSPHRASE'",
                    source_system.to_uppercase()
                ))
            })?;
        Ok(KeyProfile {
            pass_enc: None,
            key_file_path: None,
            passphrase: entry.get("passphrase").cloned(),
        })
    }

    pub fn storage_location(&self, group: &str) -> Result<StorageLocation> {
        let entry = self.storage.get(&group.to_lowercase()).ok_or_else(|| {
            DbtapError::ConfigMissingSecret(format!("storage location '{group}' not configured"))
        })?;
        Ok(StorageLocation {
            account_name: entry.get("account_name").cloned().unwrap_or_default(),
            container_name: entry.get("container_name").cloned().unwrap_or_default(),
            sas_token: entry.get("sas_token").cloned().unwrap_or_default(),
            filepath: entry.get("filepath").cloned().unwrap_or_default(),
        })
    }

    pub fn hsm(&self) -> Result<HsmAgentSettings> {
        let get = |key: &str| -> Result<String> {
            self.hsm.get(key).cloned().ok_or_else(|| {
                DbtapError::ConfigMissingSecret(format!("Missing ENV '{}'", key.to_uppercase()))
            })
        };
        Ok(HsmAgentSettings {
            host: get("hsm_host")?,
            port: get("hsm_port")?,
            dpk: get("hsm_dpk")?,
            java_class_path: get("hsm_java_class_path")?,
            java_class_name: get("hsm_java_class_name")?,
        })
    }

    /// Root of the human/framework log tree for this project.
    pub fn log_root(&self) -> String {
        format!("/app_log_{0}/{0}/extraction", self.project)
    }

    /// Root of the operation-log table for this project and environment.
    pub fn oplog_root(&self) -> String {
        format!("/app_log_{0}/{0}/fw_log/extraction", self.project)
    }

    /// Flattened `<group>__<field>` entries exported to placeholder rendering,
    /// alongside `env`. Connection and key catalogs stay out of templates.
    pub fn export_map(&self) -> IndexMap<String, String> {
        let mut map = IndexMap::new();
        map.insert("env".to_string(), self.environment.clone());
        for (group, fields) in &self.storage {
            for (field, value) in fields {
                map.insert(format!("{group}__{field}"), value.clone());
            }
        }
        map
    }
}

fn insert_catalog_entry(
    catalog: &mut HashMap<String, HashMap<String, String>>,
    rest: &str,
    value: String,
) {
    if let Some((name, field)) = rest.split_once("__") {
        catalog
            .entry(name.to_lowercase())
            .or_default()
            .insert(field.to_lowercase(), value);
    }
}
