#![allow(dead_code)]

use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use sshdump::context::JobContext;
use sshdump::core::storage::{StorageBackend, TransferRequest, UploadError};
use sshdump::core::{
    ArtifactSource, CommandOutput, DumpArtifact, GlobalProgress, PipeBridge, PipeCloser,
    PipeReader, ProcessOutput, RemoteShell,
};
use sshdump::{Error, Result};

/// Ordered record of what happened across backends and the shell.
pub type Events = Arc<Mutex<Vec<String>>>;

pub fn events() -> Events {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct InMemoryProcess(Cursor<Vec<u8>>);

impl Read for InMemoryProcess {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut self.0, buf)
    }
}

impl ProcessOutput for InMemoryProcess {
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) {}
}

/// Serves the same bytes for every artifact and counts how often it was
/// opened.
pub struct MemorySource {
    data: Vec<u8>,
    pub opened: AtomicUsize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data,
            opened: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ArtifactSource for MemorySource {
    async fn open(&self, artifact: &DumpArtifact, ctx: &JobContext) -> Result<(PipeReader, PipeCloser)> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let process = InMemoryProcess(Cursor::new(self.data.clone()));
        Ok(PipeBridge::spawn(process, artifact.size, artifact.file_name(), ctx))
    }
}

/// Records every command; `rm` can be made to fail.
pub struct RecordingShell {
    pub events: Events,
    pub fail_rm: bool,
}

impl RecordingShell {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            fail_rm: false,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.strip_prefix("shell:").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl RemoteShell for RecordingShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.events.lock().unwrap().push(format!("shell:{command}"));
        let status = if self.fail_rm && command.starts_with("rm ") { 1 } else { 0 };
        Ok(CommandOutput {
            status,
            output: if status == 0 { String::new() } else { "rm: permission denied".into() },
        })
    }
}

/// Tracks how many transfers are streaming at once, optionally delegating
/// the actual write to a real backend.
#[derive(Clone, Default)]
pub struct Gauge {
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl Gauge {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct GaugeBackend {
    pub name: String,
    pub gauge: Gauge,
    pub events: Events,
    pub inner: Option<Arc<dyn StorageBackend>>,
    pub fail: bool,
    pub delay: Duration,
    /// Progress readings taken while draining.
    pub samples: Arc<Mutex<Vec<u64>>>,
    pub progress: Arc<Mutex<Option<Arc<GlobalProgress>>>>,
}

impl GaugeBackend {
    pub fn new(name: &str, gauge: Gauge, events: Events) -> Self {
        Self {
            name: name.to_string(),
            gauge,
            events,
            inner: None,
            fail: false,
            delay: Duration::from_millis(20),
            samples: Arc::new(Mutex::new(Vec::new())),
            progress: Arc::new(Mutex::new(None)),
        }
    }

    pub fn wrapping(mut self, inner: Arc<dyn StorageBackend>) -> Self {
        self.inner = Some(inner);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    async fn drain(&self, req: &TransferRequest) -> Result<u64> {
        let (mut reader, closer) = req.source.open(&req.artifact, &req.ctx).await?;
        let mut buf = vec![0u8; 16 * 1024];
        let mut total = 0u64;
        let copied = loop {
            match reader.read(&mut buf).await {
                Ok(0) => break Ok(total),
                Ok(n) => {
                    total += n as u64;
                    if let Some(progress) = &req.ctx.progress {
                        self.samples.lock().unwrap().push(progress.completed());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        tokio::time::sleep(self.delay).await;
        drop(reader);
        closer.settle(copied).await
    }
}

#[async_trait]
impl StorageBackend for GaugeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, req: &TransferRequest) -> std::result::Result<u64, UploadError> {
        *self.progress.lock().unwrap() = req.ctx.progress.clone();
        self.gauge.enter();
        self.events.lock().unwrap().push(format!("start:{}", self.name));

        let result = if self.fail {
            tokio::time::sleep(self.delay).await;
            Err(UploadError::new(&self.name, Error::ObjectStore("bucket unreachable".into())))
        } else if let Some(inner) = &self.inner {
            inner.save(req).await
        } else {
            self.drain(req).await.map_err(|e| UploadError::new(&self.name, e))
        };

        self.events.lock().unwrap().push(format!("done:{}", self.name));
        self.gauge.leave();
        result
    }
}
