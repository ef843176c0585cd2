use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use ssh2::Sftp;
use tokio_util::io::SyncIoBridge;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{
    StorageBackend, StorageTarget, TransferRequest, TransferState, UploadError, enter, finish_save,
};
use crate::core::connection::{Connection, SshConfig};
use crate::core::pipe::{PipeCloser, PipeReader};
use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct SftpConfig {
    #[serde(flatten)]
    pub ssh: SshConfig,
    pub dir: PathBuf,
}

/// Uploads over SFTP to a second SSH host.
pub struct SftpBackend {
    name: String,
    config: SftpConfig,
}

impl SftpBackend {
    pub fn new(name: impl Into<String>, config: SftpConfig) -> Self {
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
        let mut connection = Connection::new(self.config.ssh.clone());
        connection.connect().await?;
        let session = connection.session()?.clone();

        enter(&self.name, TransferState::VerifyingDestination);
        let dir = self.config.dir.clone();
        let sftp = tokio::task::spawn_blocking(move || -> Result<Sftp> {
            let sftp = session.sftp()?;
            ensure_dir(&sftp, &dir)?;
            Ok(sftp)
        })
        .await??;

        enter(&self.name, TransferState::Streaming);
        let remote_path = self.config.dir.join(req.artifact.file_name());
        let (reader, closer) = req.source.open(&req.artifact, &req.ctx).await?;
        let result = stream_to(sftp, remote_path.clone(), reader, closer).await;
        connection.close();

        let bytes = result?;
        info!(addr = %self.config.ssh.addr(), path = %remote_path.display(), bytes, "Artifact uploaded");
        Ok(bytes)
    }
}

/// The file operations a remote upload needs.
trait RemoteFiles: Send + 'static {
    type File: Write;

    fn create(&self, path: &Path) -> io::Result<Self::File>;
    fn unlink(&self, path: &Path) -> io::Result<()>;
}

impl RemoteFiles for Sftp {
    type File = ssh2::File;

    fn create(&self, path: &Path) -> io::Result<ssh2::File> {
        Sftp::create(self, path).map_err(io::Error::from)
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        Sftp::unlink(self, path).map_err(io::Error::from)
    }
}

fn write_file<F: RemoteFiles>(files: &F, path: &Path, reader: &mut impl Read) -> io::Result<u64> {
    let mut file = files.create(path)?;
    let copied = io::copy(reader, &mut file)?;
    file.flush()?;
    Ok(copied)
}

/// Copy the bridge into `path`. A failed or cancelled transfer unlinks the
/// partial file.
async fn stream_to<F: RemoteFiles>(
    files: F,
    path: PathBuf,
    reader: PipeReader,
    closer: PipeCloser,
) -> Result<u64> {
    let mut bridge = SyncIoBridge::new(reader);
    let (files, path, copied) = tokio::task::spawn_blocking(move || {
        let copied = write_file(&files, &path, &mut bridge);
        (files, path, copied)
    })
    .await?;

    let result = closer.settle(copied).await;
    if result.is_err() {
        let removed = tokio::task::spawn_blocking(move || {
            let removed = files.unlink(&path);
            (path, removed)
        })
        .await;
        match removed {
            Ok((path, Ok(()))) => debug!(path = %path.display(), "Removed partial remote file"),
            Ok((path, Err(e))) => {
                warn!(path = %path.display(), error = %e, "Failed to remove partial remote file")
            }
            Err(e) => warn!(error = %e, "Failed to remove partial remote file"),
        }
    }
    result
}

/// `mkdir -p` over SFTP.
fn ensure_dir(sftp: &Sftp, dir: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if sftp.stat(&current).is_ok() {
            continue;
        }
        if let Err(e) = sftp.mkdir(&current, 0o755) {
            // Lost a race with another writer.
            if sftp.stat(&current).is_err() {
                return Err(e.into());
            }
        }
        debug!(path = %current.display(), "Created remote directory");
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for SftpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, req: &TransferRequest) -> Result<u64, UploadError> {
        let span = info_span!("sftp_save", target = %self.name, artifact = %req.artifact.file_name());
        finish_save(&self.name, self.transfer(req)).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobContext;
    use crate::core::pipe::{PipeBridge, ProcessOutput};
    use crate::error::Error;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Store = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

    #[derive(Clone, Default)]
    struct MemoryFiles(Store);

    struct MemoryFile {
        path: PathBuf,
        store: Store,
    }

    impl Write for MemoryFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut store = self.store.lock().unwrap();
            store.entry(self.path.clone()).or_default().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RemoteFiles for MemoryFiles {
        type File = MemoryFile;

        fn create(&self, path: &Path) -> io::Result<MemoryFile> {
            self.0.lock().unwrap().insert(path.to_path_buf(), Vec::new());
            Ok(MemoryFile {
                path: path.to_path_buf(),
                store: self.0.clone(),
            })
        }

        fn unlink(&self, path: &Path) -> io::Result<()> {
            self.0.lock().unwrap().remove(path);
            Ok(())
        }
    }

    /// Yields `len` bytes, then exits with `status`.
    struct Dump {
        remaining: usize,
        status: i32,
    }

    impl Read for Dump {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.remaining);
            buf[..n].fill(b'd');
            self.remaining -= n;
            Ok(n)
        }
    }

    impl ProcessOutput for Dump {
        fn finish(&mut self) -> Result<()> {
            match self.status {
                0 => Ok(()),
                status => {
                    Err(crate::error::CommandError::new("cat /tmp/a.sql", status, String::new()).into())
                }
            }
        }

        fn abort(&mut self) {}
    }

    #[tokio::test]
    async fn completed_upload_keeps_the_file() {
        let files = MemoryFiles::default();
        let (reader, closer) = PipeBridge::spawn(
            Dump { remaining: 100_000, status: 0 },
            100_000,
            "t",
            &JobContext::default(),
        );

        let bytes = stream_to(files.clone(), PathBuf::from("/srv/a.sql"), reader, closer)
            .await
            .unwrap();

        assert_eq!(bytes, 100_000);
        assert_eq!(files.0.lock().unwrap()[Path::new("/srv/a.sql")].len(), 100_000);
    }

    #[tokio::test]
    async fn failed_upload_unlinks_partial_file() {
        let files = MemoryFiles::default();
        let (reader, closer) = PipeBridge::spawn(
            Dump { remaining: 100_000, status: 2 },
            100_000,
            "t",
            &JobContext::default(),
        );

        let err = stream_to(files.clone(), PathBuf::from("/srv/a.sql"), reader, closer)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Command(_)));
        assert!(files.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_upload_unlinks_partial_file() {
        let files = MemoryFiles::default();
        let ctx = JobContext::default();
        ctx.cancel.cancel();
        let (reader, closer) =
            PipeBridge::spawn(Dump { remaining: 100_000, status: 0 }, 100_000, "t", &ctx);

        let err = stream_to(files.clone(), PathBuf::from("/srv/a.sql"), reader, closer)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(files.0.lock().unwrap().is_empty());
    }

    #[test]
    fn config_flattens_ssh_settings() {
        let target = StorageTarget::new("mirror", "sftp")
            .with_param("host", "backup.example.com")
            .with_param("user", "archive")
            .with_param("password", "hunter2")
            .with_param("dir", "/srv/dumps");

        let config: SftpConfig = target.settings().unwrap();
        assert_eq!(config.ssh.addr(), "backup.example.com:22");
        assert_eq!(config.dir, PathBuf::from("/srv/dumps"));
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_dialing() {
        let target = StorageTarget::new("mirror", "sftp")
            .with_param("host", "backup.invalid")
            .with_param("user", "archive")
            .with_param("dir", "/srv/dumps");
        let backend = SftpBackend::from_target(&target).unwrap();

        let req = TransferRequest {
            artifact: crate::core::models::DumpArtifact::new("/tmp/a.sql", 1, false),
            source: Arc::new(crate::core::pipe::RemoteArtifactSource::new(SshConfig::new(
                "db.invalid",
                "root",
            ))),
            ctx: crate::context::JobContext::default(),
        };
        let err = backend.save(&req).await.unwrap_err();
        assert_eq!(err.backend, "mirror");
        assert!(matches!(
            *err.source,
            crate::error::Error::AuthMethodMissing { .. }
        ));
    }
}
