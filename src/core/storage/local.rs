use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{Instrument, info, info_span, warn};

use super::{
    StorageBackend, StorageTarget, TransferRequest, TransferState, UploadError, enter, finish_save,
};
use crate::error::Result;

/// Write buffer in front of the destination file.
const BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    pub dir: PathBuf,
    /// fsync the file before reporting success.
    #[serde(default = "default_sync")]
    pub sync: bool,
}

fn default_sync() -> bool {
    true
}

/// Copies artifacts into a directory on the machine running the backup.
pub struct LocalBackend {
    name: String,
    config: LocalConfig,
}

impl LocalBackend {
    pub fn new(name: impl Into<String>, config: LocalConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn from_target(target: &StorageTarget) -> Result<Arc<dyn StorageBackend>> {
        Ok(Arc::new(Self::new(&target.name, target.settings()?)))
    }

    async fn transfer(&self, req: &TransferRequest) -> Result<u64> {
        enter(&self.name, TransferState::Authenticating);

        enter(&self.name, TransferState::VerifyingDestination);
        fs::create_dir_all(&self.config.dir).await?;
        let destination = self.config.dir.join(req.artifact.file_name());

        enter(&self.name, TransferState::Streaming);
        let start = Instant::now();
        let (mut reader, closer) = req.source.open(&req.artifact, &req.ctx).await?;
        let copied = write_file(&mut reader, &destination, self.config.sync).await;
        drop(reader);

        match closer.settle(copied).await {
            Ok(bytes) => {
                info!(
                    path = %destination.display(),
                    bytes,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Artifact written"
                );
                Ok(bytes)
            }
            Err(e) => {
                if let Err(remove_err) = fs::remove_file(&destination).await {
                    warn!(path = %destination.display(), error = %remove_err, "Failed to remove partial file");
                }
                Err(e)
            }
        }
    }
}

async fn write_file<R>(reader: &mut R, destination: &Path, sync: bool) -> std::io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let file = File::create(destination).await?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
    let copied = tokio::io::copy(reader, &mut writer).await?;
    writer.flush().await?;

    if sync {
        writer.get_ref().sync_all().await?;
    }
    Ok(copied)
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, req: &TransferRequest) -> Result<u64, UploadError> {
        let span = info_span!("local_save", target = %self.name, artifact = %req.artifact.file_name());
        finish_save(&self.name, self.transfer(req)).instrument(span).await
    }
}
