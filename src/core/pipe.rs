//! The pipe bridge: a remote process's output as a cancellable,
//! progress-instrumented `AsyncRead`.
//!
//! A blocking pump reads the source in fixed-size chunks and pushes them
//! through a bounded channel, so a slow destination applies backpressure all
//! the way back to the remote `cat`. One writer (the pump), one reader (the
//! storage backend).

use std::io::{self, Read};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::JobContext;
use crate::core::connection::{Connection, SshConfig};
use crate::core::models::DumpArtifact;
use crate::core::progress::{GlobalProgress, ProgressMeter};
use crate::error::{Error, Result};

/// Read size of the pump loop.
pub const PIPE_BUFFER_SIZE: usize = 32 * 1024;

/// Chunks buffered between pump and reader.
const PIPE_DEPTH: usize = 8;

/// Output of a running process, read to completion by the pump.
pub trait ProcessOutput: Read + Send + 'static {
    /// Called after EOF: wait for the process to exit, check its status and
    /// release its session.
    fn finish(&mut self) -> Result<()>;

    /// Called when the transfer stopped early. Must not wait for the process.
    fn abort(&mut self);
}

/// Read end of the bridge.
pub struct PipeReader {
    inner: StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Completion handle of the bridge.
pub struct PipeCloser {
    pump: JoinHandle<Result<u64>>,
}

impl PipeCloser {
    /// Wait for the pump and the remote process. Drop or drain the reader
    /// first; a live reader that stopped reading keeps the pump blocked.
    pub async fn close(self) -> Result<u64> {
        self.pump.await?
    }

    /// Close after the reader was consumed by a copy that produced `copied`.
    /// A copy failure wins over the pump's own view of the same failure,
    /// except that cancellation is always reported as such.
    pub async fn settle<E: Into<Error>>(self, copied: Result<u64, E>) -> Result<u64> {
        let pumped = self.close().await;
        match (copied, pumped) {
            (_, Err(Error::Cancelled)) => Err(Error::Cancelled),
            (Err(e), _) => Err(e.into()),
            (Ok(_), Err(e)) => Err(e),
            (Ok(copied), Ok(_)) => Ok(copied),
        }
    }
}

pub struct PipeBridge;

impl PipeBridge {
    /// Start pumping `source` and return both ends. Progress goes to the
    /// job's `GlobalProgress` when the context carries one, otherwise to a
    /// per-transfer meter labelled `label`.
    pub fn spawn<P: ProcessOutput>(
        source: P,
        expected_size: u64,
        label: impl Into<String>,
        ctx: &JobContext,
    ) -> (PipeReader, PipeCloser) {
        let (tx, rx) = mpsc::channel(PIPE_DEPTH);
        let label = label.into();
        let cancel = ctx.cancel.clone();
        let progress = ctx.progress.clone();

        let pump = tokio::task::spawn_blocking(move || {
            pump(source, tx, expected_size, label, cancel, progress)
        });

        let reader = PipeReader {
            inner: StreamReader::new(ReceiverStream::new(rx)),
        };
        (reader, PipeCloser { pump })
    }
}

fn pump<P: ProcessOutput>(
    mut source: P,
    tx: mpsc::Sender<io::Result<Bytes>>,
    expected_size: u64,
    label: String,
    cancel: CancellationToken,
    progress: Option<Arc<GlobalProgress>>,
) -> Result<u64> {
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut meter = progress
        .is_none()
        .then(|| ProgressMeter::new(label.clone(), expected_size));
    let mut transferred: u64 = 0;

    let outcome = loop {
        if cancel.is_cancelled() {
            let _ = tx.blocking_send(Err(Error::cancelled_io()));
            break Err(Error::Cancelled);
        }

        match source.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                transferred += n as u64;
                match (&progress, meter.as_mut()) {
                    (Some(progress), _) => progress.add(n as u64),
                    (None, Some(meter)) => meter.advance(n as u64),
                    (None, None) => {}
                }

                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    break Err(Error::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "pipe reader dropped before end of stream",
                    )));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
                break Err(e.into());
            }
        }
    };
    drop(tx);

    match outcome {
        Ok(()) => {
            source.finish()?;
            debug!(transfer = %label, bytes = transferred, "Pipe drained");
            Ok(transferred)
        }
        Err(e) => {
            source.abort();
            debug!(transfer = %label, bytes = transferred, error = %e, "Pipe aborted");
            Err(e)
        }
    }
}

/// Where storage backends get the bytes of an artifact from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn open(&self, artifact: &DumpArtifact, ctx: &JobContext)
    -> Result<(PipeReader, PipeCloser)>;
}

/// Streams artifacts from the remote host, one fresh SSH transport per call.
pub struct RemoteArtifactSource {
    config: SshConfig,
}

impl RemoteArtifactSource {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ArtifactSource for RemoteArtifactSource {
    async fn open(
        &self,
        artifact: &DumpArtifact,
        ctx: &JobContext,
    ) -> Result<(PipeReader, PipeCloser)> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut connection = Connection::new(self.config.clone());
        connection.connect().await?;
        let process = connection.open_stream(&artifact.path).await?.owning(connection);

        Ok(PipeBridge::spawn(
            process,
            artifact.size,
            artifact.file_name(),
            ctx,
        ))
    }
}
