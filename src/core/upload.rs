//! Fan-out of one artifact to every configured destination.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::context::JobContext;
use crate::core::connection::{RemoteShell, quote};
use crate::core::models::{DumpArtifact, UploadReport};
use crate::core::pipe::ArtifactSource;
use crate::core::progress::{GlobalProgress, spawn_reporter};
use crate::core::storage::{StorageBackend, TransferRequest, UploadError};
use crate::error::{Error, Result};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// When a run with some failed destinations counts as failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Fail only when every destination failed.
    #[default]
    All,
    /// Fail as soon as one destination failed.
    Any,
}

impl FailurePolicy {
    pub fn is_failure(self, failed: usize, total: usize) -> bool {
        match self {
            FailurePolicy::All => failed > 0 && failed == total,
            FailurePolicy::Any => failed > 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSettings {
    pub max_parallel: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            failure_policy: FailurePolicy::default(),
        }
    }
}

pub struct Uploader {
    backends: Vec<Arc<dyn StorageBackend>>,
    source: Arc<dyn ArtifactSource>,
    settings: UploadSettings,
}

impl Uploader {
    pub fn new(
        backends: Vec<Arc<dyn StorageBackend>>,
        source: Arc<dyn ArtifactSource>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            backends,
            source,
            settings,
        }
    }

    /// Stream `artifact` to every backend, at most `max_parallel` at a time,
    /// then delete each of `removals` from the remote host through `shell`.
    ///
    /// Removal happens only after every transfer returned, whatever the
    /// outcome, and is skipped when the job was cancelled. A failed removal
    /// fails the run.
    pub async fn uploading(
        &self,
        artifact: &DumpArtifact,
        removals: &[DumpArtifact],
        shell: &dyn RemoteShell,
        ctx: &JobContext,
    ) -> Result<UploadReport> {
        if self.backends.is_empty() {
            return Err(Error::Config(format!(
                "no storage targets for {}",
                artifact.file_name()
            )));
        }

        let targets = self.backends.len();
        let progress = Arc::new(GlobalProgress::new(
            artifact.size.saturating_mul(targets as u64),
        ));
        let job = ctx.with_progress(progress.clone());
        let stop = ctx.cancel.child_token();
        let reporter = spawn_reporter(progress.clone(), REPORT_INTERVAL, stop.clone());

        info!(
            artifact = %artifact.file_name(),
            size = artifact.size,
            targets,
            max_parallel = self.settings.max_parallel,
            "Starting upload"
        );
        let start = Instant::now();
        let mut report = self.transfer_all(artifact, &job).await;

        stop.cancel();
        if let Err(e) = reporter.await {
            debug!(error = %e, "Progress reporter ended abnormally");
        }

        if ctx.is_cancelled() {
            info!(
                artifact = %artifact.file_name(),
                "Upload cancelled, leaving remote artifacts in place"
            );
            return Err(Error::Cancelled);
        }

        for removal in removals.iter().filter(|a| a.remove) {
            shell
                .run_command(&format!("rm -f {}", quote(&removal.path)))
                .await
                .map_err(|e| Error::Cleanup {
                    path: removal.path.clone(),
                    source: Box::new(e),
                })?;
            info!(path = %removal.path, "Removed remote artifact");
            report.removed.push(removal.path.clone());
        }

        let failed = report.failed.len();
        info!(
            artifact = %artifact.file_name(),
            succeeded = report.succeeded.len(),
            failed,
            bytes = report.bytes,
            duration_ms = start.elapsed().as_millis() as u64,
            "Upload finished"
        );

        if self.settings.failure_policy.is_failure(failed, targets) {
            let summary = report
                .failed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::UploadsFailed {
                failed,
                total: targets,
                summary,
            });
        }
        Ok(report)
    }

    async fn transfer_all(&self, artifact: &DumpArtifact, job: &JobContext) -> UploadReport {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        let mut report = UploadReport::default();

        for backend in &self.backends {
            if job.is_cancelled() {
                report
                    .failed
                    .push(UploadError::new(backend.name(), Error::Cancelled));
                continue;
            }

            let backend = backend.clone();
            let name = backend.name().to_string();
            let semaphore = semaphore.clone();
            let req = TransferRequest {
                artifact: artifact.clone(),
                source: self.source.clone(),
                ctx: job.clone(),
            };
            let span = info_span!("transfer", job = %job.job_id, target = %backend.name());

            let handle = tasks.spawn(
                async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| UploadError::new(backend.name(), Error::Task(e.to_string())))?;
                    if req.ctx.is_cancelled() {
                        return Err(UploadError::new(backend.name(), Error::Cancelled));
                    }
                    backend.save(&req).await
                }
                .instrument(span),
            );
            names.insert(handle.id(), name);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (name, outcome) = match joined {
                Ok((id, outcome)) => (names.remove(&id).unwrap_or_default(), outcome),
                Err(e) => {
                    let name = names.remove(&e.id()).unwrap_or_default();
                    let err = UploadError::new(&name, e.into());
                    (name, Err(err))
                }
            };

            match outcome {
                Ok(bytes) => {
                    info!(target = %name, bytes, "Destination complete");
                    report.bytes += bytes;
                    report.succeeded.push(name);
                }
                Err(err) if err.source.is_cancelled() => {
                    info!(target = %name, "Transfer cancelled");
                    report.failed.push(err);
                }
                Err(err) => {
                    warn!(target = %name, error = %err, "Transfer failed");
                    report.failed.push(err);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_policy_tolerates_partial_failure() {
        let policy = FailurePolicy::All;
        assert!(!policy.is_failure(0, 3));
        assert!(!policy.is_failure(2, 3));
        assert!(policy.is_failure(3, 3));
    }

    #[test]
    fn any_policy_fails_on_first_failure() {
        let policy = FailurePolicy::Any;
        assert!(!policy.is_failure(0, 3));
        assert!(policy.is_failure(1, 3));
    }

    #[test]
    fn policy_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: FailurePolicy,
        }
        let parsed: Wrapper = serde_json::from_str(r#"{"policy":"any"}"#).unwrap();
        assert_eq!(parsed.policy, FailurePolicy::Any);
    }
}
