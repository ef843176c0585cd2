//! Error taxonomy for the backup pipeline.
//!
//! Four classes matter to callers:
//! - connection-class (`Error::Connection`): dial/handshake/auth failures, the
//!   only errors the retry policy will retry
//! - command-class (`Error::Command`): a remote command exited non-zero
//! - upload-class (`Error::Upload`): a named storage backend failed
//! - cancellation (`Error::Cancelled`): the job's cancellation token fired

use std::io;

use thiserror::Error;

use crate::core::storage::UploadError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection to {addr} failed: {message}")]
    Connection { addr: String, message: String },

    #[error("no authentication method configured for {addr} (set private_key or password)")]
    AuthMethodMissing { addr: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("{failed} of {total} destinations failed: {summary}")]
    UploadsFailed {
        failed: usize,
        total: usize,
        summary: String,
    },

    #[error("failed to remove remote artifact {path}: {source}")]
    Cleanup {
        path: String,
        #[source]
        source: Box<Error>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("FTP error: {0}")]
    Ftp(#[from] suppaftp::FtpError),

    /// Request URLs are stripped, they may carry SAS signatures.
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("background task failed: {0}")]
    Task(String),
}

/// A remote command that exited with a non-zero status.
///
/// `Display` only ever shows the masked text. The unmasked output stays
/// available through [`CommandError::raw_output`].
#[derive(Error, Debug)]
#[error("remote command `{command}` exited with status {status}: {message}")]
pub struct CommandError {
    pub status: i32,
    /// Masked command line.
    pub command: String,
    /// Masked combined stdout/stderr.
    pub message: String,
    output: String,
}

impl CommandError {
    pub fn new(command: &str, status: i32, output: String) -> Self {
        Self {
            status,
            command: crate::mask::mask(command),
            message: crate::mask::mask(output.trim()),
            output,
        }
    }

    pub fn raw_output(&self) -> &str {
        &self.output
    }
}

impl Error {
    pub fn connection(addr: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            addr: addr.into(),
            message: message.to_string(),
        }
    }

    /// True for dial and authentication failures.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Upload(e) => e.source.is_cancelled(),
            Error::RetriesExhausted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Wraps a cancellation so it can travel through an `io::Error`.
    /// `Interrupted` would be retried by `std::io::copy`, so this uses `Other`.
    pub(crate) fn cancelled_io() -> io::Error {
        io::Error::other(Error::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let cancelled = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<Error>())
            .is_some_and(|inner| matches!(inner, Error::Cancelled));

        if cancelled { Error::Cancelled } else { Error::Io(err) }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err.without_url())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
