use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::GlobalProgress;

/// Per-job state threaded through every component of a backup: the job id
/// used in log spans, the cancellation scope and, during the upload phase,
/// the shared progress counter.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub cancel: CancellationToken,
    pub progress: Option<Arc<GlobalProgress>>,
}

impl JobContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            job_id: uuid::Uuid::now_v7().to_string(),
            cancel,
            progress: None,
        }
    }

    /// Same job, with a job-wide progress counter attached.
    pub fn with_progress(&self, progress: Arc<GlobalProgress>) -> Self {
        Self {
            job_id: self.job_id.clone(),
            cancel: self.cancel.clone(),
            progress: Some(progress),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for JobContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
