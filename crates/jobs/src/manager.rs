//! In-memory job registry and bounded scheduler.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobflow_core::{ClassifiedError, JobId, panic_message};

use crate::context::JobContext;
use crate::error::JobError;
use crate::observer::{JobObserver, LoggingObserver};
use crate::queue::ReadyQueue;
use crate::resources::ResourcePools;
use crate::types::{Job, JobOptions, JobStats, JobStatus, ResourceStats, clamp_progress};

/// The work a scheduled job runs: payload and context in, result out.
pub type Executor =
    Arc<dyn Fn(Value, JobContext) -> BoxFuture<'static, Result<Value, ClassifiedError>> + Send + Sync>;

/// Adapt an async closure into an [`Executor`].
pub fn executor_fn<F, Fut>(f: F) -> Executor
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ClassifiedError>> + Send + 'static,
{
    Arc::new(move |payload, ctx| f(payload, ctx).boxed())
}

/// Job manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobManagerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum simultaneously running jobs (at least 1)
    pub max_concurrent: usize,
    /// Terminal jobs older than this are purged after each job settles
    pub retention: Option<Duration>,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            name: "job-manager".to_string(),
            max_concurrent: 4,
            retention: None,
        }
    }
}

impl JobManagerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateJobOptions {
    /// Caller-chosen id; generated when absent.
    pub id: Option<JobId>,
    pub options: JobOptions,
}

impl CreateJobOptions {
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.params.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Clone)]
pub struct ScheduleOptions {
    pub executor: Executor,
    /// Overrides the priority given at creation.
    pub priority: Option<i32>,
}

impl ScheduleOptions {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Upper bound between re-checks when no notification arrives.
    pub poll_interval: Duration,
    pub max_wait: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Query over the registry. The default returns every job, newest first.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Empty matches every status.
    pub statuses: Vec<JobStatus>,
    pub job_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Jobs that are not yet terminal.
    pub fn active() -> Self {
        Self {
            statuses: vec![JobStatus::Queued, JobStatus::Running, JobStatus::Paused],
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_order(mut self, sort_by: SortField, order: SortOrder) -> Self {
        self.sort_by = sort_by;
        self.order = order;
        self
    }

    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.job_type.as_ref().is_none_or(|t| *t == job.job_type)
            && self.created_after.is_none_or(|at| job.created_at > at)
            && self.created_before.is_none_or(|at| job.created_at < at)
    }
}

struct RunState {
    token: CancellationToken,
    started_at: DateTime<Utc>,
}

struct JobRecord {
    job: Job,
    executor: Option<Executor>,
    priority: i32,
    /// Cancelled when the job is cancelled; each run gets a child token.
    token: CancellationToken,
    run: Option<RunState>,
    /// Terminal and observers done.
    settled: bool,
    notify: Arc<Notify>,
    /// Status changes not yet delivered to the observer, in transition order.
    pending: VecDeque<(Job, JobStatus)>,
    delivering: bool,
    /// Live [`JobWatch`]es; the retention sweep keeps watched jobs.
    watchers: usize,
}

#[derive(Default)]
struct Dispatch {
    ready: ReadyQueue,
    running: usize,
}

struct Inner {
    config: JobManagerConfig,
    observer: Arc<dyn JobObserver>,
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    dispatch: Mutex<Dispatch>,
    pools: Mutex<ResourcePools>,
}

/// Owns every job: creation, scheduling, state transitions and waiting.
///
/// Cheap to clone; clones share state. Scheduling spawns tokio tasks, so
/// `schedule_job` and `resume_job` must be called inside a runtime.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new(JobManagerConfig::default())
    }
}

impl JobManager {
    pub fn new(config: JobManagerConfig) -> Self {
        Self::with_observer(config, Arc::new(LoggingObserver))
    }

    pub fn with_observer(config: JobManagerConfig, observer: Arc<dyn JobObserver>) -> Self {
        let config = JobManagerConfig {
            max_concurrent: config.max_concurrent.max(1),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                config,
                observer,
                jobs: RwLock::new(HashMap::new()),
                dispatch: Mutex::new(Dispatch::default()),
                pools: Mutex::new(ResourcePools::default()),
            }),
        }
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.inner.config
    }

    /// Register a new `Queued` job. Ids must be unique.
    pub fn create_job(
        &self,
        job_type: impl Into<String>,
        payload: Value,
        options: CreateJobOptions,
    ) -> Result<Job, JobError> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(JobError::InvalidInput("job type must not be empty".into()));
        }
        let id = options.id.unwrap_or_else(JobId::generate);
        let job = Job::new(id.clone(), job_type, payload, options.options);

        {
            let mut jobs = self.write_jobs();
            if jobs.contains_key(&id) {
                return Err(JobError::AlreadyExists(id));
            }
            jobs.insert(
                id.clone(),
                JobRecord {
                    job: job.clone(),
                    executor: None,
                    priority: job.options.priority,
                    token: CancellationToken::new(),
                    run: None,
                    settled: false,
                    notify: Arc::new(Notify::new()),
                    pending: VecDeque::new(),
                    delivering: false,
                    watchers: 0,
                },
            );
        }

        info!(
            manager = %self.inner.config.name,
            job_id = %id,
            job_type = %job.job_type,
            "job created"
        );
        Ok(job)
    }

    /// Attach an executor and enqueue a `Queued` job.
    pub fn schedule_job(&self, id: &JobId, options: ScheduleOptions) -> Result<(), JobError> {
        {
            let mut jobs = self.write_jobs();
            let record = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.clone()))?;
            let mut dispatch = self.lock_dispatch();
            if record.job.status != JobStatus::Queued || dispatch.ready.contains(id) {
                return Err(JobError::InvalidState {
                    id: id.clone(),
                    status: record.job.status,
                    operation: "schedule",
                });
            }
            record.executor = Some(options.executor);
            if let Some(priority) = options.priority {
                record.priority = priority;
            }
            dispatch.ready.push(id.clone(), record.priority);
        }

        debug!(manager = %self.inner.config.name, job_id = %id, "job scheduled");
        self.pump();
        Ok(())
    }

    pub fn get_job(&self, id: &JobId) -> Option<Job> {
        self.read_jobs().get(id).map(|r| r.job.clone())
    }

    pub fn get_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .read_jobs()
            .values()
            .filter(|r| filter.matches(&r.job))
            .map(|r| r.job.clone())
            .collect();

        jobs.sort_by(|a, b| {
            let ordering = match filter.sort_by {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            }
            .then_with(|| a.id.cmp(&b.id));
            match filter.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let page = jobs.into_iter().skip(filter.offset);
        match filter.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        }
    }

    /// Queued, Running or Paused -> Cancelled.
    pub async fn cancel_job(&self, id: &JobId) -> Result<Job, JobError> {
        let (job, previous) = {
            let mut jobs = self.write_jobs();
            let record = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.clone()))?;
            let previous = record.job.transition(JobStatus::Cancelled)?;
            record.token.cancel();
            if let Some(run) = record.run.take() {
                record
                    .job
                    .record_run(run.started_at, false, Some("cancelled".into()));
            }
            if previous == JobStatus::Queued {
                self.lock_dispatch().ready.remove(id);
            }
            record.pending.push_back((record.job.clone(), previous));
            (record.job.clone(), previous)
        };

        self.lock_pools().release(id, None);
        info!(manager = %self.inner.config.name, job_id = %id, from = %previous, "job cancelled");
        self.deliver(id).await;
        Ok(job)
    }

    /// Running or Queued -> Paused. A running executor sees its token cancelled
    /// and its eventual outcome is discarded.
    pub async fn pause_job(&self, id: &JobId) -> Result<Job, JobError> {
        let (job, previous) = {
            let mut jobs = self.write_jobs();
            let record = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.clone()))?;
            let previous = record.job.transition(JobStatus::Paused)?;
            match previous {
                JobStatus::Queued => {
                    self.lock_dispatch().ready.remove(id);
                }
                JobStatus::Running => {
                    if let Some(run) = record.run.take() {
                        run.token.cancel();
                        record
                            .job
                            .record_run(run.started_at, false, Some("paused".into()));
                    }
                }
                _ => {}
            }
            record.pending.push_back((record.job.clone(), previous));
            (record.job.clone(), previous)
        };

        info!(manager = %self.inner.config.name, job_id = %id, from = %previous, "job paused");
        self.deliver(id).await;
        Ok(job)
    }

    /// Paused -> Queued; re-enqueued when an executor was scheduled before.
    pub async fn resume_job(&self, id: &JobId) -> Result<Job, JobError> {
        let (job, enqueued) = {
            let mut jobs = self.write_jobs();
            let record = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.clone()))?;
            let previous = record.job.transition(JobStatus::Queued)?;
            let enqueued = record.executor.is_some();
            if enqueued {
                self.lock_dispatch().ready.push(id.clone(), record.priority);
            }
            record.pending.push_back((record.job.clone(), previous));
            (record.job.clone(), enqueued)
        };

        info!(manager = %self.inner.config.name, job_id = %id, enqueued, "job resumed");
        self.deliver(id).await;
        if enqueued {
            self.pump();
        }
        Ok(job)
    }

    /// Set progress (clamped to 0..=100) of a running job.
    pub async fn update_progress(&self, id: &JobId, progress: f64) -> Result<Job, JobError> {
        self.apply_progress(id, None, progress).await
    }

    pub(crate) async fn report_run_progress(&self, id: &JobId, attempt: u32, progress: f64) {
        if let Err(err) = self.apply_progress(id, Some(attempt), progress).await {
            debug!(job_id = %id, error = %err, "progress report ignored");
        }
    }

    async fn apply_progress(
        &self,
        id: &JobId,
        attempt: Option<u32>,
        progress: f64,
    ) -> Result<Job, JobError> {
        let progress = clamp_progress(progress);
        let job = {
            let mut jobs = self.write_jobs();
            let record = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.clone()))?;
            let current_run = attempt.is_none_or(|a| a == record.job.attempt);
            if record.job.status != JobStatus::Running || !current_run {
                return Err(JobError::InvalidState {
                    id: id.clone(),
                    status: record.job.status,
                    operation: "update progress of",
                });
            }
            record.job.progress = progress;
            record.job.updated_at = Utc::now();
            record.job.clone()
        };

        let observer = Arc::clone(&self.inner.observer);
        if let Err(panic) = AssertUnwindSafe(observer.on_progress(&job, progress))
            .catch_unwind()
            .await
        {
            error!(job_id = %id, panic = %panic_message(&*panic), "job observer panicked");
        }
        Ok(job)
    }

    /// Remove a job, cancelling it first if it is still active.
    pub async fn delete_job(&self, id: &JobId) -> Result<Job, JobError> {
        let active = self
            .get_job(id)
            .ok_or_else(|| JobError::NotFound(id.clone()))?
            .status
            .is_active();
        if active {
            match self.cancel_job(id).await {
                Ok(_) | Err(JobError::InvalidTransition { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        let record = self
            .write_jobs()
            .remove(id)
            .ok_or_else(|| JobError::NotFound(id.clone()))?;
        self.lock_pools().release(id, None);
        record.notify.notify_waiters();
        info!(manager = %self.inner.config.name, job_id = %id, "job deleted");
        Ok(record.job)
    }

    /// Remove terminal jobs last updated more than `older_than` ago. Jobs with a
    /// live [`JobWatch`] are kept.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let removed = {
            let mut jobs = self.write_jobs();
            let before = jobs.len();
            jobs.retain(|_, r| {
                !(r.settled && r.watchers == 0 && r.job.is_terminal() && r.job.updated_at <= cutoff)
            });
            before - jobs.len()
        };
        if removed > 0 {
            info!(manager = %self.inner.config.name, removed, "finished jobs purged");
        }
        removed
    }

    /// Resolve once the job is terminal and its terminal observers have run.
    pub async fn wait_for_terminal(
        &self,
        id: &JobId,
        options: WaitOptions,
    ) -> Result<Job, JobError> {
        self.watch(id)?.wait(options).await
    }

    /// Register interest in `id` before it can finish. The job survives the
    /// retention sweep until the returned watch is dropped.
    pub fn watch(&self, id: &JobId) -> Result<JobWatch, JobError> {
        self.write_jobs()
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.clone()))?
            .watchers += 1;
        Ok(JobWatch {
            manager: self.clone(),
            id: id.clone(),
        })
    }

    /// Change the priority of an unfinished job. A queued job moves to its new
    /// place in the ready queue, behind jobs already waiting at that priority.
    pub fn prioritize_job(&self, id: &JobId, priority: i32) -> Result<Job, JobError> {
        let (job, requeued) = {
            let mut jobs = self.write_jobs();
            let record = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.clone()))?;
            if record.job.is_terminal() {
                return Err(JobError::InvalidState {
                    id: id.clone(),
                    status: record.job.status,
                    operation: "reprioritize",
                });
            }
            record.priority = priority;
            record.job.options.priority = priority;
            record.job.updated_at = Utc::now();
            let mut dispatch = self.lock_dispatch();
            let requeued = dispatch.ready.remove(id);
            if requeued {
                dispatch.ready.push(id.clone(), priority);
            }
            (record.job.clone(), requeued)
        };

        info!(
            manager = %self.inner.config.name,
            job_id = %id,
            priority,
            requeued,
            "job reprioritized"
        );
        Ok(job)
    }

    async fn wait_until_settled(&self, id: &JobId, options: WaitOptions) -> Result<Job, JobError> {
        let poll_interval = options.poll_interval.max(Duration::from_millis(1));
        let wait = async {
            loop {
                let notify = match self.wait_state(id) {
                    Err(err) => return Err(err),
                    Ok(Ok(job)) => return Ok(job),
                    Ok(Err(notify)) => notify,
                };
                let notified = notify.notified();
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        };

        match options.max_wait {
            Some(max_wait) => tokio::time::timeout(max_wait, wait)
                .await
                .map_err(|_| JobError::WaitTimeout {
                    id: id.clone(),
                    waited: max_wait,
                })?,
            None => wait.await,
        }
    }

    fn wait_state(&self, id: &JobId) -> Result<Result<Job, Arc<Notify>>, JobError> {
        let jobs = self.read_jobs();
        let record = jobs.get(id).ok_or_else(|| JobError::NotFound(id.clone()))?;
        if record.settled {
            Ok(Ok(record.job.clone()))
        } else {
            Ok(Err(Arc::clone(&record.notify)))
        }
    }

    pub fn get_job_stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for record in self.read_jobs().values() {
            stats.count(record.job.status);
        }
        stats
    }

    pub fn get_resource_stats(&self) -> ResourceStats {
        let max_concurrent = self.inner.config.max_concurrent;
        let (running, queue_depth) = {
            let dispatch = self.lock_dispatch();
            (dispatch.running, dispatch.ready.len())
        };
        ResourceStats {
            max_concurrent,
            running,
            available_slots: max_concurrent.saturating_sub(running),
            utilization: running as f64 / max_concurrent as f64,
            queue_depth,
            pools: self.lock_pools().stats(),
        }
    }

    /// Define (or resize) a named resource pool.
    pub fn set_resource_limit(&self, name: impl Into<String>, total: u64) {
        self.lock_pools().set_limit(name, total);
    }

    /// Reserve resources for an active job. All-or-nothing.
    pub fn allocate_resources(
        &self,
        id: &JobId,
        request: &HashMap<String, u64>,
    ) -> Result<(), JobError> {
        let jobs = self.read_jobs();
        let record = jobs.get(id).ok_or_else(|| JobError::NotFound(id.clone()))?;
        if record.job.is_terminal() {
            return Err(JobError::InvalidState {
                id: id.clone(),
                status: record.job.status,
                operation: "allocate resources for",
            });
        }
        self.lock_pools().allocate(id, request)
    }

    /// Release named resources held by `id`, or all of them.
    pub fn release_resources(&self, id: &JobId, names: Option<&[String]>) -> HashMap<String, u64> {
        self.lock_pools().release(id, names)
    }

    /// Start queued jobs while slots are free.
    fn pump(&self) {
        loop {
            let next = {
                let mut dispatch = self.lock_dispatch();
                if dispatch.running >= self.inner.config.max_concurrent {
                    return;
                }
                match dispatch.ready.pop() {
                    Some(id) => {
                        dispatch.running += 1;
                        id
                    }
                    None => return,
                }
            };
            if !self.start(next) {
                self.release_slot();
            }
        }
    }

    fn start(&self, id: JobId) -> bool {
        let (snapshot, executor, ctx) = {
            let mut jobs = self.write_jobs();
            let Some(record) = jobs.get_mut(&id) else {
                return false;
            };
            let Some(executor) = record.executor.clone() else {
                return false;
            };
            if record.job.status != JobStatus::Queued {
                return false;
            }
            let Ok(previous) = record.job.transition(JobStatus::Running) else {
                return false;
            };
            let token = record.token.child_token();
            record.run = Some(RunState {
                token: token.clone(),
                started_at: Utc::now(),
            });
            let ctx = JobContext::for_run(
                id.clone(),
                record.job.job_type.clone(),
                record.job.attempt,
                record.job.options.params.clone(),
                token,
                self.clone(),
            );
            record.pending.push_back((record.job.clone(), previous));
            (record.job.clone(), executor, ctx)
        };

        tokio::spawn(self.clone().run(snapshot, executor, ctx));
        true
    }

    async fn run(self, snapshot: Job, executor: Executor, ctx: JobContext) {
        info!(
            manager = %self.inner.config.name,
            job_id = %snapshot.id,
            job_type = %snapshot.job_type,
            attempt = snapshot.attempt,
            "job started"
        );
        self.deliver(&snapshot.id).await;

        if self.is_current_run(&snapshot.id, snapshot.attempt) {
            let outcome = match AssertUnwindSafe(executor(snapshot.payload.clone(), ctx))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(ClassifiedError::processing(format!(
                    "executor panicked: {}",
                    panic_message(&*panic)
                ))
                .pin()),
            };
            self.finish_run(&snapshot.id, snapshot.attempt, outcome).await;
        } else {
            debug!(job_id = %snapshot.id, "run interrupted before the executor started");
        }

        self.release_slot();
        self.pump();
    }

    fn is_current_run(&self, id: &JobId, attempt: u32) -> bool {
        self.read_jobs()
            .get(id)
            .is_some_and(|r| r.job.status == JobStatus::Running && r.job.attempt == attempt)
    }

    async fn finish_run(&self, id: &JobId, attempt: u32, outcome: Result<Value, ClassifiedError>) {
        let (job, previous) = {
            let mut jobs = self.write_jobs();
            let Some(record) = jobs.get_mut(id) else {
                return;
            };
            if record.job.status != JobStatus::Running || record.job.attempt != attempt {
                debug!(
                    job_id = %id,
                    status = %record.job.status,
                    attempt,
                    "discarding outcome of interrupted run"
                );
                return;
            }
            let started_at = record
                .run
                .take()
                .map(|run| run.started_at)
                .unwrap_or_else(Utc::now);
            let transitioned = match outcome {
                Ok(value) => {
                    record.job.record_run(started_at, true, None);
                    record.job.complete(value)
                }
                Err(err) => {
                    record.job.record_run(started_at, false, Some(err.to_string()));
                    record.job.fail(err)
                }
            };
            match transitioned {
                Ok(previous) => {
                    record.pending.push_back((record.job.clone(), previous));
                    (record.job.clone(), previous)
                }
                Err(err) => {
                    warn!(job_id = %id, error = %err, "failed to record job outcome");
                    return;
                }
            }
        };

        self.lock_pools().release(id, None);
        match &job.error {
            None => info!(manager = %self.inner.config.name, job_id = %id, "job completed"),
            Some(err) => warn!(
                manager = %self.inner.config.name,
                job_id = %id,
                kind = %err.kind,
                error = %err.message,
                "job failed"
            ),
        }
        debug!(job_id = %id, from = %previous, "run finished");
        self.deliver(id).await;
    }

    /// Hand queued status changes of `id` to the observer in transition order.
    /// Delivery runs on its own task so a dropped caller cannot strand the
    /// queue half drained.
    async fn deliver(&self, id: &JobId) {
        let manager = self.clone();
        let job_id = id.clone();
        if let Err(err) = tokio::spawn(async move { manager.drain(&job_id).await }).await {
            error!(job_id = %id, error = %err, "status delivery aborted");
        }
    }

    /// Only one task drains a job's queue at a time; a concurrent caller (an
    /// observer cancelling its own job, say) returns at once and its change is
    /// delivered by the task already draining. A job is settled after its
    /// terminal change has been delivered.
    async fn drain(&self, id: &JobId) {
        {
            let mut jobs = self.write_jobs();
            let Some(record) = jobs.get_mut(id) else {
                return;
            };
            if record.delivering {
                return;
            }
            record.delivering = true;
        }

        loop {
            let next = {
                let mut jobs = self.write_jobs();
                let Some(record) = jobs.get_mut(id) else {
                    return;
                };
                let next = record.pending.pop_front();
                if next.is_none() {
                    record.delivering = false;
                }
                next
            };
            let Some((job, previous)) = next else {
                return;
            };
            self.notify_status(&job, previous).await;
            if job.is_terminal() {
                self.settle(id);
            }
        }
    }

    /// Mark a terminal job settled and release its waiters.
    fn settle(&self, id: &JobId) {
        let notify = {
            let mut jobs = self.write_jobs();
            match jobs.get_mut(id) {
                Some(record) => {
                    record.settled = true;
                    Arc::clone(&record.notify)
                }
                None => return,
            }
        };
        notify.notify_waiters();

        if let Some(retention) = self.inner.config.retention {
            self.purge_finished(retention);
        }
    }

    async fn notify_status(&self, job: &Job, previous: JobStatus) {
        let observer = Arc::clone(&self.inner.observer);
        if let Err(panic) = AssertUnwindSafe(observer.on_status_change(job, previous))
            .catch_unwind()
            .await
        {
            error!(job_id = %job.id, panic = %panic_message(&*panic), "job observer panicked");
        }
    }

    fn release_slot(&self) {
        let mut dispatch = self.lock_dispatch();
        dispatch.running = dispatch.running.saturating_sub(1);
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        self.inner.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        self.inner.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_dispatch(&self) -> MutexGuard<'_, Dispatch> {
        self.inner.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pools(&self) -> MutexGuard<'_, ResourcePools> {
        self.inner.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Interest in one job's terminal state, from [`JobManager::watch`].
#[derive(Debug)]
pub struct JobWatch {
    manager: JobManager,
    id: JobId,
}

impl JobWatch {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Resolve once the job is terminal and its terminal observers have run.
    pub async fn wait(&self, options: WaitOptions) -> Result<Job, JobError> {
        self.manager.wait_until_settled(&self.id, options).await
    }
}

impl Drop for JobWatch {
    fn drop(&mut self) {
        let released = {
            let mut jobs = self.manager.write_jobs();
            match jobs.get_mut(&self.id) {
                Some(record) => {
                    record.watchers = record.watchers.saturating_sub(1);
                    record.watchers == 0 && record.settled
                }
                None => false,
            }
        };
        if released {
            if let Some(retention) = self.manager.inner.config.retention {
                self.manager.purge_finished(retention);
            }
        }
    }
}
