//! Layered configuration: built-in defaults, then the TOML file, then
//! `SSHDUMP_*` environment variables, then command-line overrides.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::backup::{BackupJob, BackupSettings, EncryptionConfig};
use crate::core::connection::SshConfig;
use crate::core::models::DumpCommand;
use crate::core::storage::StorageTarget;
use crate::core::upload::{FailurePolicy, UploadSettings};
use crate::error::{Error, Result};
use crate::logging::LogConfig;

pub const DEFAULT_CONFIG_PATH: &str = "sshdump.toml";
const ENV_PREFIX: &str = "SSHDUMP_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub max_parallel_uploads: usize,
    pub retry_attempts: u32,
    pub upload_failure_policy: FailurePolicy,
    /// Directory used by `local` storages that do not set their own `dir`.
    pub local_dump_dir: PathBuf,
    pub log: LogConfig,
    pub servers: BTreeMap<String, ServerConfig>,
    pub databases: Vec<DatabaseConfig>,
    pub storages: BTreeMap<String, StorageTarget>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_parallel_uploads: 2,
            retry_attempts: 3,
            upload_failure_policy: FailurePolicy::All,
            local_dump_dir: PathBuf::from("backups"),
            log: LogConfig::default(),
            servers: BTreeMap::new(),
            databases: Vec::new(),
            storages: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub ssh: SshConfig,
    /// Remote directory the dumps are written to.
    #[serde(default = "default_dump_dir")]
    pub dump_dir: String,
}

fn default_dump_dir() -> String {
    "/tmp/sshdump".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub server: String,
    pub dump_command: String,
    /// Remote path the dump command writes.
    pub artifact: String,
    #[serde(default)]
    pub remove_after_upload: bool,
    #[serde(default)]
    pub reuse_existing: bool,
    pub storages: Vec<String>,
    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,
}

impl AppConfig {
    /// Load from `path` (or `sshdump.toml`), the environment and `overrides`,
    /// then validate.
    pub fn load<T: Serialize>(path: Option<&Path>, overrides: &T) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::globals(overrides));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_uploads < 1 {
            return Err(Error::Config(
                "max_parallel_uploads must be at least 1".to_string(),
            ));
        }
        if self.retry_attempts < 1 {
            return Err(Error::Config("retry_attempts must be at least 1".to_string()));
        }

        let mut names = HashSet::new();
        for db in &self.databases {
            if !names.insert(db.name.as_str()) {
                return Err(Error::Config(format!("database {} is defined twice", db.name)));
            }
            if !self.servers.contains_key(&db.server) {
                return Err(Error::Config(format!(
                    "database {} references unknown server {}",
                    db.name, db.server
                )));
            }
            if db.storages.is_empty() {
                return Err(Error::Config(format!("database {} has no storages", db.name)));
            }
            if let Some(missing) = db.storages.iter().find(|s| !self.storages.contains_key(*s)) {
                return Err(Error::Config(format!(
                    "database {} references unknown storage {missing}",
                    db.name
                )));
            }
        }
        Ok(())
    }

    pub fn backup_settings(&self) -> BackupSettings {
        BackupSettings {
            retry_attempts: self.retry_attempts,
            upload: UploadSettings {
                max_parallel: self.max_parallel_uploads,
                failure_policy: self.upload_failure_policy,
            },
        }
    }

    /// Resolve one database into a self-contained job.
    pub fn job(&self, database: &str) -> Result<BackupJob> {
        let db = self
            .databases
            .iter()
            .find(|db| db.name == database)
            .ok_or_else(|| Error::Config(format!("unknown database {database}")))?;
        let server = self
            .servers
            .get(&db.server)
            .ok_or_else(|| Error::Config(format!("unknown server {}", db.server)))?;

        let storages = db
            .storages
            .iter()
            .map(|name| self.storage(name))
            .collect::<Result<Vec<_>>>()?;

        Ok(BackupJob {
            database: db.name.clone(),
            server: server.ssh.clone(),
            dump_dir: server.dump_dir.clone(),
            dump: DumpCommand {
                command: db.dump_command.clone(),
                artifact_path: db.artifact.clone(),
            },
            remove_after_upload: db.remove_after_upload,
            reuse_existing: db.reuse_existing,
            encryption: db.encryption.clone(),
            storages,
        })
    }

    /// Jobs for `selected` databases, or every database when empty.
    pub fn jobs(&self, selected: &[String]) -> Result<Vec<BackupJob>> {
        if selected.is_empty() {
            self.databases.iter().map(|db| self.job(&db.name)).collect()
        } else {
            selected.iter().map(|name| self.job(name)).collect()
        }
    }

    fn storage(&self, name: &str) -> Result<StorageTarget> {
        let mut target = self
            .storages
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown storage {name}")))?;
        target.name = name.to_string();

        if target.kind == "local" && !target.params.contains_key("dir") {
            target.params.insert(
                "dir".to_string(),
                self.local_dump_dir.to_string_lossy().into_owned().into(),
            );
        }
        Ok(target)
    }
}
