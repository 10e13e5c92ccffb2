//! Job record, status machine and statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use jobflow_core::{ClassifiedError, JobId};

use crate::error::JobError;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a concurrency slot (or for `schedule_job`).
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Running | Paused | Cancelled)
                | (Running, Completed | Failed | Paused | Cancelled)
                | (Paused, Queued | Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-provided options stored on the job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Higher runs first.
    pub priority: i32,
    /// Job-specific parameters visible to the executor.
    pub params: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

/// Record of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A unit of work tracked by the `JobManager`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: Value,
    pub options: JobOptions,
    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    /// Set only when `Completed`.
    pub result: Option<Value>,
    /// Set only when `Failed`.
    pub error: Option<ClassifiedError>,
    /// Number of times the job entered `Running`.
    pub attempt: u32,
    pub history: Vec<JobAttemptRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, job_type: impl Into<String>, payload: Value, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_type: job_type.into(),
            payload,
            options,
            status: JobStatus::Queued,
            progress: 0,
            result: None,
            error: None,
            attempt: 0,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, or fail without touching the job.
    pub fn transition(&mut self, to: JobStatus) -> Result<JobStatus, JobError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        if to == JobStatus::Running {
            self.attempt += 1;
        }
        Ok(from)
    }

    pub fn complete(&mut self, result: Value) -> Result<JobStatus, JobError> {
        let from = self.transition(JobStatus::Completed)?;
        self.result = Some(result);
        self.progress = 100;
        Ok(from)
    }

    pub fn fail(&mut self, error: ClassifiedError) -> Result<JobStatus, JobError> {
        let from = self.transition(JobStatus::Failed)?;
        self.error = Some(error);
        Ok(from)
    }

    pub(crate) fn record_run(
        &mut self,
        started_at: DateTime<Utc>,
        success: bool,
        error: Option<String>,
    ) {
        let now = Utc::now();
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Clamp a progress report to `0..=100`.
pub fn clamp_progress(progress: f64) -> u8 {
    if progress.is_nan() {
        return 0;
    }
    progress.round().clamp(0.0, 100.0) as u8
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub(crate) fn count(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Paused => self.paused += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Occupancy of one named resource pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: u64,
    pub allocated: u64,
    pub available: u64,
}

/// Concurrency and resource-pool usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStats {
    pub max_concurrent: usize,
    pub running: usize,
    pub available_slots: usize,
    /// `running / max_concurrent`
    pub utilization: f64,
    pub queue_depth: usize,
    pub pools: BTreeMap<String, PoolStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::ErrorKind;
    use proptest::prelude::*;
    use serde_json::json;

    fn job() -> Job {
        Job::new(JobId::generate(), "ocr", json!({}), JobOptions::default())
    }

    #[test]
    fn lifecycle_sets_result_and_attempt() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        assert_eq!(job.attempt, 1);
        job.complete(json!({"text": "hi"})).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.result.is_some());
        assert!(job.error.is_none());
    }

    #[test]
    fn terminal_jobs_reject_everything() {
        let mut job = job();
        job.transition(JobStatus::Cancelled).unwrap();
        let before = job.clone();

        for to in JobStatus::ALL {
            let err = job.transition(to).unwrap_err();
            assert!(matches!(err, JobError::InvalidTransition { .. }));
        }
        assert_eq!(job, before);
    }

    #[test]
    fn failing_requires_running() {
        let mut job = job();
        assert!(job.fail(ClassifiedError::processing("boom")).is_err());
        assert!(job.error.is_none());

        job.transition(JobStatus::Running).unwrap();
        job.fail(ClassifiedError::processing("boom")).unwrap();
        assert_eq!(job.error.as_ref().map(|e| e.kind), Some(ErrorKind::Processing));
        assert!(job.result.is_none());
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(clamp_progress(-5.0), 0);
        assert_eq!(clamp_progress(42.4), 42);
        assert_eq!(clamp_progress(250.0), 100);
        assert_eq!(clamp_progress(f64::NAN), 0);
    }

    fn status() -> impl Strategy<Value = JobStatus> {
        proptest::sample::select(JobStatus::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn only_legal_transitions_apply(targets in proptest::collection::vec(status(), 0..32)) {
            let mut job = job();
            for to in targets {
                let before = job.clone();
                let allowed = before.status.can_transition_to(to);
                let result = job.transition(to);

                prop_assert_eq!(result.is_ok(), allowed);
                if allowed {
                    prop_assert_eq!(job.status, to);
                } else {
                    prop_assert_eq!(&job, &before);
                }
                if before.status.is_terminal() {
                    prop_assert!(result.is_err());
                }
            }
        }
    }
}
