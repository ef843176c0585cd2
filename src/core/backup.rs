//! One database's full cycle: connect, dump, optionally encrypt, upload,
//! clean up.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, info_span, warn};

use crate::context::JobContext;
use crate::core::connection::{Connection, RemoteShell, SshConfig, quote};
use crate::core::models::{BackupReport, DumpArtifact, DumpCommand};
use crate::core::pipe::RemoteArtifactSource;
use crate::core::retry::with_retry;
use crate::core::storage::{Registry, StorageBackend, StorageTarget};
use crate::core::upload::{UploadSettings, Uploader};
use crate::error::{Error, Result};

/// Environment variable carrying the encryption passphrase to `openssl`.
/// Its name matches the credential masking rules.
const PASSPHRASE_VAR: &str = "SSHDUMP_ENC_PASSWORD";

#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub passphrase: String,
    /// Keep the unencrypted dump on the remote host.
    #[serde(default)]
    pub keep_plain: bool,
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("passphrase", &crate::mask::MASK)
            .field("keep_plain", &self.keep_plain)
            .finish()
    }
}

/// Everything needed to back up one database, already resolved from the
/// configuration.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub database: String,
    pub server: SshConfig,
    pub dump_dir: String,
    pub dump: DumpCommand,
    pub remove_after_upload: bool,
    pub reuse_existing: bool,
    pub encryption: Option<EncryptionConfig>,
    pub storages: Vec<StorageTarget>,
}

#[derive(Debug, Clone, Copy)]
pub struct BackupSettings {
    pub retry_attempts: u32,
    pub upload: UploadSettings,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            upload: UploadSettings::default(),
        }
    }
}

/// Artifacts on the remote host, ready to upload. The last one is the one
/// that gets uploaded; all of them are candidates for removal.
#[derive(Debug)]
pub struct PreparedDump {
    pub artifacts: Vec<DumpArtifact>,
    pub dump_duration: Option<Duration>,
}

impl PreparedDump {
    pub fn upload_artifact(&self) -> Option<&DumpArtifact> {
        self.artifacts.last()
    }
}

pub struct Backup {
    job: BackupJob,
    registry: Arc<Registry>,
    settings: BackupSettings,
}

impl Backup {
    pub fn new(job: BackupJob, registry: Arc<Registry>, settings: BackupSettings) -> Self {
        Self {
            job,
            registry,
            settings,
        }
    }

    pub async fn run(&self, ctx: &JobContext) -> Result<BackupReport> {
        let span = info_span!("backup", job = %ctx.job_id, database = %self.job.database);
        self.execute(ctx).instrument(span).await
    }

    async fn execute(&self, ctx: &JobContext) -> Result<BackupReport> {
        let backends = self.build_backends()?;

        info!(addr = %self.job.server.addr(), "Connecting");
        let (mut connection, prepared) = with_retry(
            &ctx.cancel,
            self.settings.retry_attempts,
            || self.connect_and_prepare(),
            Error::is_connection,
            |attempt, err| warn!(attempt, error = %err, "Connection attempt failed, retrying"),
        )
        .await?;

        let Some(artifact) = prepared.upload_artifact().cloned() else {
            return Err(Error::Task("dump produced no artifact".to_string()));
        };

        // Transfers open their own transports with the settings that worked,
        // including a passphrase entered at the prompt.
        let source = Arc::new(RemoteArtifactSource::new(connection.config().clone()));
        let uploader = Uploader::new(backends, source, self.settings.upload);
        let outcome = uploader
            .uploading(&artifact, &prepared.artifacts, &connection, ctx)
            .await;
        connection.close();

        let upload = outcome?;
        info!(
            succeeded = upload.succeeded.len(),
            failed = upload.failed.len(),
            bytes = upload.bytes,
            "Backup finished"
        );

        Ok(BackupReport {
            database: self.job.database.clone(),
            artifacts: prepared.artifacts,
            dump_duration: prepared.dump_duration,
            upload,
        })
    }

    /// Upload phase only, for an artifact already on the remote host.
    pub async fn upload_existing(&self, path: &str, ctx: &JobContext) -> Result<BackupReport> {
        let span = info_span!("upload", job = %ctx.job_id, database = %self.job.database);
        self.upload_phase(path, ctx).instrument(span).await
    }

    async fn upload_phase(&self, path: &str, ctx: &JobContext) -> Result<BackupReport> {
        let backends = self.build_backends()?;
        let (mut connection, size) = with_retry(
            &ctx.cancel,
            self.settings.retry_attempts,
            || async move {
                let mut connection = Connection::new(self.job.server.clone());
                connection.connect().await?;
                let size = remote_size(&connection, path).await?;
                Ok::<_, Error>((connection, size))
            },
            Error::is_connection,
            |attempt, err| warn!(attempt, error = %err, "Connection attempt failed, retrying"),
        )
        .await?;

        let artifact = DumpArtifact::new(path, size, self.job.remove_after_upload);
        let source = Arc::new(RemoteArtifactSource::new(connection.config().clone()));
        let uploader = Uploader::new(backends, source, self.settings.upload);
        let outcome = uploader
            .uploading(&artifact, std::slice::from_ref(&artifact), &connection, ctx)
            .await;
        connection.close();

        Ok(BackupReport {
            database: self.job.database.clone(),
            artifacts: vec![artifact],
            dump_duration: None,
            upload: outcome?,
        })
    }

    fn build_backends(&self) -> Result<Vec<Arc<dyn StorageBackend>>> {
        self.job
            .storages
            .iter()
            .map(|target| self.registry.build(target))
            .collect()
    }

    async fn connect_and_prepare(&self) -> Result<(Connection, PreparedDump)> {
        let mut connection = Connection::new(self.job.server.clone());
        connection.connect().await?;
        connection.test_connection().await?;
        let prepared = prepare_artifacts(&connection, &self.job).await?;
        Ok((connection, prepared))
    }
}

/// The shell-only part of a backup: make sure the dump directory exists,
/// produce (or reuse) the dump, measure it and encrypt it if configured.
pub async fn prepare_artifacts(shell: &dyn RemoteShell, job: &BackupJob) -> Result<PreparedDump> {
    let path = job.dump.artifact_path.as_str();
    shell
        .run_command(&format!("mkdir -p {}", quote(&job.dump_dir)))
        .await?;

    let exists = shell.exec(&format!("test -f {}", quote(path))).await?.success();
    let dump_duration = if exists && job.reuse_existing {
        info!(path, "Reusing existing dump");
        None
    } else {
        let start = Instant::now();
        shell.run_command(&job.dump.command).await?;
        Some(start.elapsed())
    };

    let size = remote_size(shell, path).await?;
    info!(
        path,
        size,
        elapsed_ms = dump_duration.map(|d| d.as_millis() as u64),
        "Dump created"
    );

    let mut artifacts = vec![DumpArtifact::new(path, size, job.remove_after_upload)];

    if let Some(encryption) = &job.encryption {
        let encrypted = format!("{path}.enc");
        let start = Instant::now();
        shell
            .run_command(&encrypt_command(path, &encrypted, &encryption.passphrase))
            .await?;
        let encrypted_size = remote_size(shell, &encrypted).await?;
        info!(
            path = %encrypted,
            size = encrypted_size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Dump encrypted"
        );

        artifacts[0].remove = !encryption.keep_plain;
        artifacts.push(DumpArtifact::new(
            encrypted,
            encrypted_size,
            job.remove_after_upload,
        ));
    }

    Ok(PreparedDump {
        artifacts,
        dump_duration,
    })
}

fn encrypt_command(plain: &str, encrypted: &str, passphrase: &str) -> String {
    format!(
        "{PASSPHRASE_VAR}={} openssl enc -aes-256-cbc -pbkdf2 -salt -in {} -out {} -pass env:{PASSPHRASE_VAR}",
        quote(passphrase),
        quote(plain),
        quote(encrypted)
    )
}

async fn remote_size(shell: &dyn RemoteShell, path: &str) -> Result<u64> {
    let output = shell
        .run_command(&format!("stat -c %s {}", quote(path)))
        .await?;
    output
        .trim()
        .parse()
        .map_err(|_| Error::Task(format!("unexpected size {:?} for {path}", output.trim())))
}
