pub mod backup;
pub mod connection;
pub mod models;
pub mod pipe;
pub mod progress;
pub mod retry;
pub mod storage;
pub mod upload;

pub use backup::{Backup, BackupJob, BackupSettings, EncryptionConfig, prepare_artifacts};
pub use connection::{CommandOutput, Connection, RemoteShell, SshConfig};
pub use models::{BackupReport, DumpArtifact, DumpCommand, UploadReport};
pub use pipe::{ArtifactSource, PipeBridge, PipeCloser, PipeReader, ProcessOutput, RemoteArtifactSource};
pub use progress::GlobalProgress;
pub use retry::{backoff_delay, with_retry};
pub use storage::{Registry, StorageBackend, StorageTarget, TransferRequest, UploadError};
pub use upload::{FailurePolicy, UploadSettings, Uploader};
