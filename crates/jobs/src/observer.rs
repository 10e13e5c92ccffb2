//! Job lifecycle observer.

use async_trait::async_trait;
use tracing::debug;

use crate::types::{Job, JobStatus};

/// Notified by the `JobManager` on status changes and progress.
///
/// Terminal notifications finish before `wait_for_terminal` callers are
/// released. Panics are caught and logged by the manager.
#[async_trait]
pub trait JobObserver: Send + Sync {
    async fn on_status_change(&self, _job: &Job, _previous: JobStatus) {}

    async fn on_progress(&self, _job: &Job, _progress: u8) {}
}

/// Observer that only emits debug logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

#[async_trait]
impl JobObserver for LoggingObserver {
    async fn on_status_change(&self, job: &Job, previous: JobStatus) {
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            from = %previous,
            to = %job.status,
            "job status changed"
        );
    }

    async fn on_progress(&self, job: &Job, progress: u8) {
        debug!(job_id = %job.id, progress, "job progress");
    }
}
