mod common;

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::time::{Duration, timeout};

use common::{Gauge, GaugeBackend, MemorySource, RecordingShell, events, pattern};
use sshdump::Error;
use sshdump::context::JobContext;
use sshdump::core::storage::{
    LocalBackend, LocalConfig, StorageBackend, TransferRequest, UploadError,
};
use sshdump::core::{DumpArtifact, FailurePolicy, UploadSettings, Uploader};

const MIB: usize = 1024 * 1024;

/// Reads the first chunk of the artifact, then cancels the job and keeps
/// draining.
struct CancelAfterFirstChunk;

#[async_trait]
impl StorageBackend for CancelAfterFirstChunk {
    fn name(&self) -> &str {
        "interrupted"
    }

    async fn save(&self, req: &TransferRequest) -> Result<u64, UploadError> {
        let fail = |e| UploadError::new("interrupted", e);
        let (mut reader, closer) = req.source.open(&req.artifact, &req.ctx).await.map_err(fail)?;

        let mut first = vec![0u8; 4096];
        let head = reader.read_exact(&mut first).await;
        req.ctx.cancel.cancel();

        let mut sink = tokio::io::sink();
        let copied = match head {
            Ok(_) => tokio::io::copy(&mut reader, &mut sink).await,
            Err(e) => Err(e),
        };
        drop(reader);
        closer.settle(copied).await.map_err(fail)
    }
}

fn settings(max_parallel: usize, failure_policy: FailurePolicy) -> UploadSettings {
    UploadSettings {
        max_parallel,
        failure_policy,
    }
}

fn local(name: &str, dir: &TempDir) -> Arc<dyn StorageBackend> {
    Arc::new(LocalBackend::new(
        name,
        LocalConfig {
            dir: dir.path().to_path_buf(),
            sync: false,
        },
    ))
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let log = events();
    let gauge = Gauge::default();
    let backends: Vec<Arc<dyn StorageBackend>> = (0..6)
        .map(|i| {
            Arc::new(GaugeBackend::new(&format!("t{i}"), gauge.clone(), log.clone()))
                as Arc<dyn StorageBackend>
        })
        .collect();

    let data = pattern(200_000);
    let artifact = DumpArtifact::new("/tmp/sshdump/app.sql.gz", data.len() as u64, false);
    let uploader = Uploader::new(backends, MemorySource::new(data), settings(2, FailurePolicy::All));
    let shell = RecordingShell::new(log.clone());

    let report = uploader
        .uploading(&artifact, &[], &shell, &JobContext::default())
        .await
        .unwrap();

    assert_eq!(report.succeeded.len(), 6);
    assert!(gauge.peak() <= 2, "peak was {}", gauge.peak());
    assert!(gauge.peak() >= 1);
}

#[tokio::test]
async fn test_cleanup_runs_after_every_transfer() {
    let log = events();
    let gauge = Gauge::default();
    let backends: Vec<Arc<dyn StorageBackend>> = vec![
        Arc::new(GaugeBackend::new("a", gauge.clone(), log.clone())),
        Arc::new(GaugeBackend::new("b", gauge.clone(), log.clone()).failing()),
        Arc::new(GaugeBackend::new("c", gauge.clone(), log.clone())),
    ];

    let data = pattern(50_000);
    let artifact = DumpArtifact::new("/tmp/sshdump/app.sql.gz", data.len() as u64, true);
    let plain = DumpArtifact::new("/tmp/sshdump/app.sql", 10, true);
    let kept = DumpArtifact::new("/tmp/sshdump/keep.sql", 10, false);
    let uploader = Uploader::new(backends, MemorySource::new(data), settings(3, FailurePolicy::All));
    let shell = RecordingShell::new(log.clone());

    let report = uploader
        .uploading(
            &artifact,
            &[plain, artifact.clone(), kept],
            &shell,
            &JobContext::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].backend, "b");
    assert_eq!(
        report.removed,
        vec!["/tmp/sshdump/app.sql", "/tmp/sshdump/app.sql.gz"]
    );

    let log = log.lock().unwrap().clone();
    let first_rm = log.iter().position(|e| e.starts_with("shell:rm")).unwrap();
    let last_done = log.iter().rposition(|e| e.starts_with("done:")).unwrap();
    assert!(last_done < first_rm, "cleanup before transfers finished: {log:?}");
    assert_eq!(log.iter().filter(|e| e.starts_with("done:")).count(), 3);
}

#[tokio::test]
async fn test_progress_converges_and_never_decreases() {
    let log = events();
    let gauge = Gauge::default();
    let probes: Vec<GaugeBackend> = (0..3)
        .map(|i| GaugeBackend::new(&format!("t{i}"), gauge.clone(), log.clone()))
        .collect();
    let samples: Vec<_> = probes.iter().map(|p| p.samples.clone()).collect();
    let progress = probes[0].progress.clone();
    let backends: Vec<Arc<dyn StorageBackend>> = probes
        .into_iter()
        .map(|p| Arc::new(p) as Arc<dyn StorageBackend>)
        .collect();

    let size = 300_000;
    let artifact = DumpArtifact::new("/tmp/sshdump/app.sql.gz", size as u64, false);
    let uploader = Uploader::new(
        backends,
        MemorySource::new(pattern(size)),
        settings(3, FailurePolicy::All),
    );
    let shell = RecordingShell::new(log.clone());

    uploader
        .uploading(&artifact, &[], &shell, &JobContext::default())
        .await
        .unwrap();

    let progress = progress.lock().unwrap().clone().unwrap();
    assert_eq!(progress.total(), 3 * size as u64);
    assert_eq!(progress.completed(), 3 * size as u64);
    assert_eq!(progress.percentage(), 100);

    for samples in samples {
        let samples = samples.lock().unwrap();
        assert!(!samples.is_empty());
        assert!(samples.windows(2).all(|w| w[0] <= w[1]));
        assert!(samples.iter().all(|&s| s <= 3 * size as u64));
    }
}

#[tokio::test]
async fn test_one_mebibyte_to_two_local_targets_serially() {
    let log = events();
    let gauge = Gauge::default();
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let backends: Vec<Arc<dyn StorageBackend>> = vec![
        Arc::new(GaugeBackend::new("a", gauge.clone(), log.clone()).wrapping(local("a", &dir_a))),
        Arc::new(GaugeBackend::new("b", gauge.clone(), log.clone()).wrapping(local("b", &dir_b))),
    ];

    let data = pattern(MIB);
    let artifact = DumpArtifact::new("/tmp/sshdump/app.sql.gz", MIB as u64, true);
    let source = MemorySource::new(data.clone());
    let uploader = Uploader::new(backends, source.clone(), settings(1, FailurePolicy::Any));
    let shell = RecordingShell::new(log.clone());

    let report = uploader
        .uploading(&artifact, &[artifact.clone()], &shell, &JobContext::default())
        .await
        .unwrap();

    assert_eq!(report.bytes, 2 * MIB as u64);
    assert_eq!(gauge.peak(), 1);
    assert_eq!(source.opened.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(std::fs::read(dir_a.path().join("app.sql.gz")).unwrap(), data);
    assert_eq!(std::fs::read(dir_b.path().join("app.sql.gz")).unwrap(), data);
    assert_eq!(shell.commands(), vec!["rm -f /tmp/sshdump/app.sql.gz"]);
}

#[tokio::test]
async fn test_failing_target_fails_job_but_cleanup_still_runs() {
    let log = events();
    let gauge = Gauge::default();
    let dir = TempDir::new().unwrap();
    let backends: Vec<Arc<dyn StorageBackend>> = vec![
        Arc::new(GaugeBackend::new("disk", gauge.clone(), log.clone()).wrapping(local("disk", &dir))),
        Arc::new(GaugeBackend::new("broken", gauge.clone(), log.clone()).failing()),
    ];

    let artifact = DumpArtifact::new("/tmp/sshdump/app.sql.gz", MIB as u64, true);
    let uploader = Uploader::new(
        backends,
        MemorySource::new(pattern(MIB)),
        settings(1, FailurePolicy::Any),
    );
    let shell = RecordingShell::new(log.clone());

    let err = uploader
        .uploading(&artifact, &[artifact.clone()], &shell, &JobContext::default())
        .await
        .unwrap_err();

    match err {
        Error::UploadsFailed {
            failed,
            total,
            summary,
        } => {
            assert_eq!((failed, total), (1, 2));
            assert!(summary.contains("broken"));
        }
        other => panic!("expected UploadsFailed, got {other}"),
    }
    assert_eq!(gauge.peak(), 1);
    assert_eq!(shell.commands(), vec!["rm -f /tmp/sshdump/app.sql.gz"]);
}

#[tokio::test]
async fn test_every_target_failing_fails_under_default_policy() {
    let log = events();
    let gauge = Gauge::default();
    let backends: Vec<Arc<dyn StorageBackend>> = vec![
        Arc::new(GaugeBackend::new("x", gauge.clone(), log.clone()).failing()),
        Arc::new(GaugeBackend::new("y", gauge.clone(), log.clone()).failing()),
    ];

    let artifact = DumpArtifact::new("/tmp/sshdump/app.sql.gz", 10, false);
    let uploader = Uploader::new(backends, MemorySource::new(pattern(10)), UploadSettings::default());
    let shell = RecordingShell::new(log.clone());

    let err = uploader
        .uploading(&artifact, &[], &shell, &JobContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UploadsFailed { failed: 2, total: 2, .. }));
}

#[tokio::test]
async fn test_cleanup_failure_is_fatal() {
    let log = events();
    let dir = TempDir::new().unwrap();
    let artifact = DumpArtifact::new("/tmp/sshdump/app.sql.gz", 1000, true);
    let uploader = Uploader::new(
        vec![local("disk", &dir)],
        MemorySource::new(pattern(1000)),
        UploadSettings::default(),
    );
    let mut shell = RecordingShell::new(log);
    shell.fail_rm = true;

    let err = uploader
        .uploading(&artifact, &[artifact.clone()], &shell, &JobContext::default())
        .await
        .unwrap_err();

    match err {
        Error::Cleanup { path, source } => {
            assert_eq!(path, "/tmp/sshdump/app.sql.gz");
            assert!(matches!(*source, Error::Command(_)));
        }
        other => panic!("expected Cleanup, got {other}"),
    }
    assert!(dir.path().join("app.sql.gz").exists());
}

#[tokio::test]
async fn test_cancelled_job_starts_nothing_and_keeps_artifacts() {
    let log = events();
    let gauge = Gauge::default();
    let backends: Vec<Arc<dyn StorageBackend>> = vec![
        Arc::new(GaugeBackend::new("a", gauge.clone(), log.clone())),
        Arc::new(GaugeBackend::new("b", gauge.clone(), log.clone())),
    ];

    let artifact = DumpArtifact::new("/tmp/sshdump/app.sql.gz", 100, true);
    let source = MemorySource::new(pattern(100));
    let uploader = Uploader::new(backends, source.clone(), UploadSettings::default());
    let shell = RecordingShell::new(log.clone());
    let ctx = JobContext::default();
    ctx.cancel.cancel();

    let err = uploader
        .uploading(&artifact, &[artifact.clone()], &shell, &ctx)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(gauge.peak(), 0);
    assert_eq!(source.opened.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(shell.commands().is_empty());
}

#[tokio::test]
async fn test_cancel_mid_stream_skips_cleanup() {
    let log = events();
    let dir = TempDir::new().unwrap();
    let backends: Vec<Arc<dyn StorageBackend>> =
        vec![Arc::new(CancelAfterFirstChunk), local("disk", &dir)];

    let size = 4 * MIB;
    let artifact = DumpArtifact::new("/tmp/sshdump/app.sql.gz", size as u64, true);
    let uploader = Uploader::new(
        backends,
        MemorySource::new(pattern(size)),
        settings(2, FailurePolicy::All),
    );
    let shell = RecordingShell::new(log.clone());
    let ctx = JobContext::default();

    let err = timeout(
        Duration::from_secs(10),
        uploader.uploading(&artifact, &[artifact.clone()], &shell, &ctx),
    )
    .await
    .expect("upload did not stop after cancellation")
    .unwrap_err();

    assert!(err.is_cancelled());
    assert!(ctx.is_cancelled());
    assert!(shell.commands().is_empty());
}
