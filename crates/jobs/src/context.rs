use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use jobflow_core::JobId;

use crate::manager::JobManager;

/// Handed to an executor for one run of a job.
///
/// The token is cancelled when the job is cancelled or paused; executors are
/// expected to check it and return promptly.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    job_type: String,
    attempt: u32,
    params: Map<String, Value>,
    token: CancellationToken,
    manager: Option<JobManager>,
}

impl JobContext {
    pub(crate) fn for_run(
        job_id: JobId,
        job_type: String,
        attempt: u32,
        params: Map<String, Value>,
        token: CancellationToken,
        manager: JobManager,
    ) -> Self {
        Self {
            job_id,
            job_type,
            attempt,
            params,
            token,
            manager: Some(manager),
        }
    }

    /// Context for running work outside a `JobManager`. Progress reports
    /// are dropped.
    pub fn detached(job_type: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            job_id: JobId::generate(),
            job_type: job_type.into(),
            attempt: 1,
            params,
            token: CancellationToken::new(),
            manager: None,
        }
    }

    /// Replace the cancellation token (for detached contexts).
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the run is cancelled or paused.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Report progress (clamped to 0..=100). Ignored once this run is no
    /// longer the job's current run.
    pub async fn report_progress(&self, progress: f64) {
        if let Some(manager) = &self.manager {
            manager
                .report_run_progress(&self.job_id, self.attempt, progress)
                .await;
        }
    }
}
