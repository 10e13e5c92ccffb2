//! `jobflow-jobs`: job lifecycle and bounded in-process scheduling.
//!
//! A [`JobManager`] owns every job. Jobs are created `Queued`, given an
//! executor with [`JobManager::schedule_job`], and run when a concurrency
//! slot is free, highest priority first. Cancellation and pausing are
//! cooperative through the [`JobContext`] token.

pub mod context;
pub mod error;
pub mod manager;
pub mod observer;
mod queue;
mod resources;
pub mod types;

pub use context::JobContext;
pub use error::JobError;
pub use manager::{
    CreateJobOptions, Executor, JobFilter, JobManager, JobManagerConfig, JobWatch,
    ScheduleOptions, SortField, SortOrder, WaitOptions, executor_fn,
};
pub use observer::{JobObserver, LoggingObserver};
pub use types::{
    Job, JobAttemptRecord, JobOptions, JobStats, JobStatus, PoolStats, ResourceStats,
    clamp_progress,
};
