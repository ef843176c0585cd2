use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use suppaftp::FtpStream;
use suppaftp::types::FileType;
use tokio_util::io::SyncIoBridge;
use tracing::{Instrument, debug, info, info_span};

use super::{
    StorageBackend, StorageTarget, TransferRequest, TransferState, UploadError, enter, finish_save,
};
use crate::error::{Error, Result};

#[derive(Clone, Deserialize)]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub dir: String,
}

fn default_port() -> u16 {
    21
}

impl FtpConfig {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &crate::mask::MASK)
            .field("dir", &self.dir)
            .finish()
    }
}

/// Uploads to a plain FTP server in binary passive mode.
pub struct FtpBackend {
    name: String,
    config: FtpConfig,
}

impl FtpBackend {
    pub fn new(name: impl Into<String>, config: FtpConfig) -> Self {
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
        let config = self.config.clone();
        let name = self.name.clone();
        let mut ftp = tokio::task::spawn_blocking(move || -> Result<FtpStream> {
            let addr = config.addr();
            let mut ftp = FtpStream::connect(&addr)
                .map_err(|e| Error::connection(&addr, format!("ftp dial: {e}")))?;
            ftp.login(config.user.as_str(), config.password.as_str())
                .map_err(|e| Error::connection(&addr, format!("ftp login: {e}")))?;

            enter(&name, TransferState::VerifyingDestination);
            change_dir(&mut ftp, &config.dir)?;
            ftp.transfer_type(FileType::Binary)?;
            Ok(ftp)
        })
        .await??;

        enter(&self.name, TransferState::Streaming);
        let file_name = req.artifact.file_name().to_string();
        let (reader, closer) = req.source.open(&req.artifact, &req.ctx).await?;
        let mut bridge = SyncIoBridge::new(reader);

        let copied = tokio::task::spawn_blocking(move || -> Result<u64> {
            let copied = ftp.put_file(file_name.as_str(), &mut bridge);
            drop(bridge);
            let _ = ftp.quit();
            Ok(copied?)
        })
        .await?;

        let bytes = closer.settle(copied).await?;
        info!(
            addr = %self.config.addr(),
            dir = %self.config.dir,
            bytes,
            "Artifact uploaded"
        );
        Ok(bytes)
    }
}

/// Walk into `dir`, creating each missing level.
fn change_dir(ftp: &mut FtpStream, dir: &str) -> Result<()> {
    if dir.starts_with('/') {
        ftp.cwd("/")?;
    }
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        if ftp.cwd(segment).is_ok() {
            continue;
        }
        ftp.mkdir(segment)?;
        ftp.cwd(segment)?;
        debug!(segment, "Created FTP directory");
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for FtpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, req: &TransferRequest) -> Result<u64, UploadError> {
        let span = info_span!("ftp_save", target = %self.name, artifact = %req.artifact.file_name());
        finish_save(&self.name, self.transfer(req)).instrument(span).await
    }
}
