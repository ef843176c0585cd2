//! Storage destinations.
//!
//! Every destination family implements [`StorageBackend`]; the [`Registry`]
//! turns a configured [`StorageTarget`] into a backend by its type tag, so the
//! upload orchestrator never needs to know which families exist.

mod azure;
mod ftp;
mod gcs;
mod local;
mod s3;
mod sftp;

pub use azure::{AzureBackend, AzureConfig};
pub use ftp::{FtpBackend, FtpConfig};
pub use gcs::{GcsBackend, GcsConfig};
pub use local::{LocalBackend, LocalConfig};
pub use s3::{S3Backend, S3Config, S3Provider};
pub use sftp::{SftpBackend, SftpConfig};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::context::JobContext;
use crate::core::models::DumpArtifact;
use crate::core::pipe::ArtifactSource;
use crate::error::{Error, Result};

/// A failed transfer, attributed to the destination it was going to.
#[derive(Error, Debug)]
#[error("upload to {backend} failed: {source}")]
pub struct UploadError {
    pub backend: String,
    #[source]
    pub source: Box<Error>,
}

impl UploadError {
    pub fn new(backend: impl Into<String>, source: Error) -> Self {
        Self {
            backend: backend.into(),
            source: Box::new(source),
        }
    }
}

/// One transfer of one artifact to one destination.
#[derive(Clone)]
pub struct TransferRequest {
    pub artifact: DumpArtifact,
    pub source: Arc<dyn ArtifactSource>,
    pub ctx: JobContext,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured target, used in logs and `UploadError`.
    fn name(&self) -> &str;

    /// Stream the artifact to the destination. Returns the bytes written.
    /// Never retries internally.
    async fn save(&self, req: &TransferRequest) -> Result<u64, UploadError>;
}

/// Lifecycle of one `save` call, logged at debug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Authenticating,
    VerifyingDestination,
    Streaming,
    Done,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            TransferState::Authenticating => "authenticating",
            TransferState::VerifyingDestination => "verifying-destination",
            TransferState::Streaming => "streaming",
            TransferState::Done => "done",
            TransferState::Failed => "failed",
        };
        f.write_str(state)
    }
}

pub(crate) fn enter(backend: &str, state: TransferState) {
    debug!(backend, state = %state, "Transfer state");
}

/// Run a backend's transfer and record its final state.
pub(crate) async fn finish_save<F>(backend: &str, transfer: F) -> Result<u64, UploadError>
where
    F: Future<Output = Result<u64>>,
{
    match transfer.await {
        Ok(bytes) => {
            enter(backend, TransferState::Done);
            Ok(bytes)
        }
        Err(err) => {
            enter(backend, TransferState::Failed);
            Err(UploadError::new(backend, err))
        }
    }
}

/// Object key / remote path for an artifact below `dir`.
pub fn destination_key(dir: &str, artifact: &DumpArtifact) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        artifact.file_name().to_string()
    } else {
        format!("{dir}/{}", artifact.file_name())
    }
}

/// Read up to `size` bytes, fewer only at end of stream.
pub(crate) async fn read_part<R>(reader: &mut R, size: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut part = Vec::with_capacity(size);
    (&mut *reader).take(size as u64).read_to_end(&mut part).await?;
    Ok(part)
}

/// A configured destination: a name, a type tag and the tag-specific
/// settings, which the matching factory deserializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageTarget {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl StorageTarget {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Deserialize the tag-specific settings.
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone()))
            .map_err(|e| Error::Config(format!("storage {} ({}): {e}", self.name, self.kind)))
    }
}

pub type BackendFactory =
    Arc<dyn Fn(&StorageTarget) -> Result<Arc<dyn StorageBackend>> + Send + Sync>;

/// Backend constructors keyed by type tag.
#[derive(Clone, Default)]
pub struct Registry {
    factories: HashMap<String, BackendFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in destination family.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("local", LocalBackend::from_target);
        registry.register("sftp", SftpBackend::from_target);
        registry.register("ftp", FtpBackend::from_target);
        registry.register("azure", AzureBackend::from_target);
        registry.register("gcs", GcsBackend::from_target);
        for provider in S3Provider::ALL {
            registry.register(provider.tag(), move |target: &StorageTarget| {
                S3Backend::from_target(provider, target)
            });
        }
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&StorageTarget) -> Result<Arc<dyn StorageBackend>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn build(&self, target: &StorageTarget) -> Result<Arc<dyn StorageBackend>> {
        let factory = self.factories.get(&target.kind).ok_or_else(|| {
            Error::Config(format!(
                "storage {}: unknown type {:?}",
                target.name, target.kind
            ))
        })?;
        factory(target)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
