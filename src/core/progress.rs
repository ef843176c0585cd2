//! Byte progress accounting for uploads.
//!
//! `GlobalProgress` is scoped to one upload job: every concurrent transfer adds
//! to the same atomic counter and a single reporter task renders it.
//! `ProgressMeter` is the per-transfer fallback used when a transfer runs
//! without a job-wide counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::logging::LogThrottle;

/// Shared `{completed, total}` counter for one job.
#[derive(Debug)]
pub struct GlobalProgress {
    completed: AtomicU64,
    total: u64,
}

impl GlobalProgress {
    pub fn new(total: u64) -> Self {
        Self {
            completed: AtomicU64::new(0),
            total,
        }
    }

    /// Record `bytes` more transferred. The counter never moves backwards and
    /// never passes `total`.
    pub fn add(&self, bytes: u64) {
        let total = self.total;
        let _ = self
            .completed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(bytes).min(total))
            });
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn percentage(&self) -> u8 {
        percentage(self.completed(), self.total)
    }
}

pub(crate) fn percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).min(100.0) as u8
}

/// Per-transfer progress that logs each 10% step.
pub struct ProgressMeter {
    label: String,
    total: u64,
    done: u64,
    last_step: u8,
    throttle: LogThrottle,
}

impl ProgressMeter {
    pub fn new(label: impl Into<String>, total: u64) -> Self {
        Self {
            label: label.into(),
            total,
            done: 0,
            last_step: 0,
            throttle: LogThrottle::new(Duration::from_millis(250)),
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.done = self.done.saturating_add(bytes);
        let step = percentage(self.done, self.total) / 10 * 10;

        if step > self.last_step && (step == 100 || self.throttle.should_log()) {
            self.last_step = step;
            info!(transfer = %self.label, percent = step, bytes = self.done, "Transfer progress");
        }
    }

    pub fn done(&self) -> u64 {
        self.done
    }
}

/// Spawn the single consumer that renders a job's `GlobalProgress` until
/// `stop` fires.
pub fn spawn_reporter(
    progress: Arc<GlobalProgress>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut last_seen = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let completed = progress.completed();
                    if completed != last_seen {
                        last_seen = completed;
                        info!(
                            completed,
                            total = progress.total(),
                            percent = progress.percentage(),
                            "Upload progress"
                        );
                    }
                }
                _ = stop.cancelled() => break,
            }
        }

        debug!(
            completed = progress.completed(),
            total = progress.total(),
            "Progress reporter stopped"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_progress_clamps_at_total() {
        let progress = GlobalProgress::new(100);
        progress.add(60);
        progress.add(60);
        assert_eq!(progress.completed(), 100);
        assert_eq!(progress.percentage(), 100);
    }

    #[test]
    fn empty_job_reports_complete() {
        let progress = GlobalProgress::new(0);
        assert_eq!(progress.percentage(), 100);
    }

    #[tokio::test]
    async fn concurrent_adds_are_not_lost() {
        let progress = Arc::new(GlobalProgress::new(8 * 1000));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let progress = progress.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    progress.add(1);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(progress.completed(), 8000);
    }

    #[test]
    fn meter_tracks_bytes() {
        let mut meter = ProgressMeter::new("test", 1000);
        meter.advance(250);
        meter.advance(750);
        assert_eq!(meter.done(), 1000);
    }
}
