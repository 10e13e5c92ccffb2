//! The pipeline front door: processor registry, middleware chain, hooks,
//! and job submission on top of a `JobManager`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use jobflow_cache::{CacheManager, CacheStats, SweeperHandle, Ttl};
use jobflow_core::{ClassifiedError, ErrorHandler, JobId};
use jobflow_jobs::{
    CreateJobOptions, Job, JobError, JobFilter, JobManager, JobObserver, JobOptions, JobStats,
    JobStatus, ResourceStats, ScheduleOptions, WaitOptions, executor_fn,
};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::execution::Execution;
use crate::hooks::{HookContext, HookEvent, HookHandler, HookRegistry};
use crate::processor::{Middleware, Processor};

/// Memoize a job's result under `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub key: String,
    pub ttl: Ttl,
}

impl CacheOptions {
    pub fn new(key: impl Into<String>, ttl: impl Into<Ttl>) -> Self {
        Self {
            key: key.into(),
            ttl: ttl.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Caller-chosen job id; generated when absent.
    pub job_id: Option<JobId>,
    /// Return as soon as the job is scheduled instead of awaiting it.
    pub detached: bool,
    /// Falls back to `PipelineConfig::poll_interval`.
    pub poll_interval: Option<Duration>,
    pub max_wait: Option<Duration>,
    pub priority: i32,
    /// Extra attempts for retryable errors.
    pub max_retries: u32,
    pub cache: Option<CacheOptions>,
    pub params: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl ProcessOptions {
    pub fn detached() -> Self {
        Self {
            detached: true,
            ..Self::default()
        }
    }

    pub fn with_job_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn with_cache(mut self, key: impl Into<String>, ttl: impl Into<Ttl>) -> Self {
        self.cache = Some(CacheOptions::new(key, ttl));
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Awaited form: the job completed with this result.
    Completed(Value),
    /// Detached form: poll `get_status` with the id.
    Submitted { job_id: JobId, status: JobStatus },
}

impl ProcessOutcome {
    pub fn into_result(self) -> Option<Value> {
        match self {
            ProcessOutcome::Completed(value) => Some(value),
            ProcessOutcome::Submitted { .. } => None,
        }
    }
}

/// Caller-facing summary of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub progress: u8,
    pub attempt: u32,
    pub result: Option<Value>,
    pub error: Option<ClassifiedError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            status: job.status,
            progress: job.progress,
            attempt: job.attempt,
            result: job.result.clone(),
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub jobs: JobStats,
    pub resources: ResourceStats,
    pub cache: CacheStats,
    pub processors: Vec<String>,
    pub middleware: usize,
    pub hooks: BTreeMap<HookEvent, usize>,
    pub errors: BTreeMap<&'static str, u64>,
}

/// Forwards terminal and progress notifications to the hook registry.
struct HookObserver {
    hooks: Arc<HookRegistry>,
}

#[async_trait]
impl JobObserver for HookObserver {
    async fn on_status_change(&self, job: &Job, previous: JobStatus) {
        debug!(job_id = %job.id, from = %previous, to = %job.status, "job status changed");
        let event = match job.status {
            JobStatus::Completed => HookEvent::OnComplete,
            JobStatus::Failed => HookEvent::OnFail,
            _ => return,
        };
        let mut ctx = HookContext::for_job(job);
        ctx.result = job.result.clone();
        ctx.error = job.error.clone();
        self.hooks.trigger(event, ctx).await;
    }

    async fn on_progress(&self, job: &Job, progress: u8) {
        self.hooks
            .trigger(HookEvent::OnProgress, HookContext::for_job(job).with_progress(progress))
            .await;
    }
}

struct Inner {
    config: PipelineConfig,
    jobs: JobManager,
    cache: CacheManager<Value>,
    errors: Arc<ErrorHandler>,
    hooks: Arc<HookRegistry>,
    processors: RwLock<HashMap<String, Arc<dyn Processor>>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
}

/// Cheap-to-clone handle; clones share processors, jobs and cache.
#[derive(Clone)]
pub struct PipelineManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("processors", &self.processor_types())
            .field("hooks", &self.inner.hooks)
            .finish_non_exhaustive()
    }
}

impl Default for PipelineManager {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl PipelineManager {
    pub fn new(config: PipelineConfig) -> Self {
        let cache = CacheManager::new(config.cache.clone());
        Self::with_parts(config, cache, Arc::new(ErrorHandler::new()))
    }

    /// Build around an existing cache and error handler.
    pub fn with_parts(
        config: PipelineConfig,
        cache: CacheManager<Value>,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        let hooks = Arc::new(HookRegistry::new());
        let observer = Arc::new(HookObserver {
            hooks: Arc::clone(&hooks),
        });
        let jobs = JobManager::with_observer(config.jobs.clone(), observer);
        let sweeping = cache.ensure_sweeper();
        info!(
            pipeline = %config.jobs.name,
            max_concurrent = config.jobs.max_concurrent,
            sweeping,
            "pipeline manager created"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                jobs,
                cache,
                errors,
                hooks,
                processors: RwLock::new(HashMap::new()),
                middleware: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn jobs(&self) -> &JobManager {
        &self.inner.jobs
    }

    pub fn cache(&self) -> &CacheManager<Value> {
        &self.inner.cache
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.inner.errors
    }

    /// Register the processor for `job_type`, replacing any previous one.
    pub fn register_processor(&self, job_type: impl Into<String>, processor: Arc<dyn Processor>) {
        let job_type = job_type.into();
        let replaced = self
            .inner
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type.clone(), processor)
            .is_some();
        if replaced {
            warn!(job_type = %job_type, "processor replaced");
        } else {
            debug!(job_type = %job_type, "processor registered");
        }
    }

    pub fn has_processor(&self, job_type: &str) -> bool {
        self.inner
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_type)
    }

    pub fn processor_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .inner
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Append to the middleware chain. Jobs submitted afterwards see it.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner
            .middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
    }

    pub fn hook(&self, event: HookEvent, handler: Arc<dyn HookHandler>) {
        self.inner.hooks.register(event, handler);
    }

    /// Submit `data` to the processor registered for `job_type`.
    ///
    /// Awaited calls resolve with the job's result or its classified error;
    /// detached calls return the job id as soon as the job is scheduled.
    pub async fn process(
        &self,
        job_type: &str,
        data: Value,
        options: ProcessOptions,
    ) -> Result<ProcessOutcome, ClassifiedError> {
        let processor = self
            .inner
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownJobType(job_type.to_string()))?;

        let job_id = options.job_id.clone().unwrap_or_else(JobId::generate);
        self.inner
            .hooks
            .trigger(
                HookEvent::BeforeCreate,
                HookContext::new(job_id.clone(), job_type).with_data(data.clone()),
            )
            .await;

        let create = CreateJobOptions {
            id: Some(job_id),
            options: JobOptions {
                priority: options.priority,
                params: options.params.clone(),
                metadata: options.metadata.clone(),
            },
        };
        let job = self
            .inner
            .jobs
            .create_job(job_type, data, create)
            .map_err(PipelineError::from)?;
        self.inner
            .hooks
            .trigger(HookEvent::AfterCreate, HookContext::for_job(&job))
            .await;

        let execution = Arc::new(Execution {
            processor,
            middleware: self
                .inner
                .middleware
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            hooks: Arc::clone(&self.inner.hooks),
            errors: Arc::clone(&self.inner.errors),
            cache: self.inner.cache.clone(),
            cache_options: options.cache.clone(),
            max_retries: options.max_retries,
        });
        let executor = executor_fn(move |payload, ctx| {
            let execution = Arc::clone(&execution);
            async move { execution.run(payload, ctx).await }
        });
        // Watch before scheduling so a retention sweep cannot remove the job
        // between its completion and the read of its result.
        let watch = if options.detached {
            None
        } else {
            Some(self.inner.jobs.watch(&job.id).map_err(PipelineError::from)?)
        };
        self.inner
            .jobs
            .schedule_job(&job.id, ScheduleOptions::new(executor))
            .map_err(PipelineError::from)?;

        info!(
            job_id = %job.id,
            job_type = %job_type,
            detached = options.detached,
            "job submitted"
        );

        let Some(watch) = watch else {
            let status = self
                .inner
                .jobs
                .get_job(&job.id)
                .map_or(job.status, |current| current.status);
            return Ok(ProcessOutcome::Submitted {
                job_id: job.id,
                status,
            });
        };

        let wait = WaitOptions {
            poll_interval: options.poll_interval.unwrap_or(self.inner.config.poll_interval),
            max_wait: options.max_wait,
        };
        let finished = watch.wait(wait).await.map_err(PipelineError::from)?;

        match finished.status {
            JobStatus::Completed => Ok(ProcessOutcome::Completed(
                finished.result.unwrap_or(Value::Null),
            )),
            JobStatus::Failed => Err(finished.error.unwrap_or_else(|| {
                ClassifiedError::unknown(format!("job {} failed without an error", finished.id))
            })),
            _ => Err(ClassifiedError::cancelled(&finished.id)),
        }
    }

    pub async fn cancel(&self, id: &JobId) -> Result<Job, ClassifiedError> {
        self.before_control(id, HookEvent::BeforeCancel).await?;
        let job = self.inner.jobs.cancel_job(id).await?;
        Ok(self.after_control(HookEvent::AfterCancel, job).await)
    }

    pub async fn pause(&self, id: &JobId) -> Result<Job, ClassifiedError> {
        self.before_control(id, HookEvent::BeforePause).await?;
        let job = self.inner.jobs.pause_job(id).await?;
        Ok(self.after_control(HookEvent::AfterPause, job).await)
    }

    pub async fn resume(&self, id: &JobId) -> Result<Job, ClassifiedError> {
        self.before_control(id, HookEvent::BeforeResume).await?;
        let job = self.inner.jobs.resume_job(id).await?;
        Ok(self.after_control(HookEvent::AfterResume, job).await)
    }

    /// Move an unfinished job to `priority`; a queued job is re-queued.
    pub fn prioritize(&self, id: &JobId, priority: i32) -> Result<Job, ClassifiedError> {
        let job = self.inner.jobs.prioritize_job(id, priority)?;
        debug!(job_id = %id, priority, "job priority changed");
        Ok(job)
    }

        pub fn get_status(&self, id: &JobId) -> Result<JobStatusView, ClassifiedError> {
        self.inner
            .jobs
            .get_job(id)
            .map(|job| JobStatusView::from(&job))
            .ok_or_else(|| JobError::NotFound(id.clone()).into())
    }

    /// Non-terminal jobs matching `filter`. Terminal statuses in the filter
    /// are ignored.
    pub fn get_active_jobs(&self, filter: JobFilter) -> Vec<Job> {
        let mut filter = filter;
        if filter.statuses.is_empty() {
            filter.statuses = JobFilter::active().statuses;
        } else {
            filter.statuses.retain(JobStatus::is_active);
            if filter.statuses.is_empty() {
                return Vec::new();
            }
        }
        self.inner.jobs.get_jobs(&filter)
    }

    pub fn get_stats(&self) -> PipelineStats {
        PipelineStats {
            jobs: self.inner.jobs.get_job_stats(),
            resources: self.inner.jobs.get_resource_stats(),
            cache: self.inner.cache.stats(),
            processors: self.processor_types(),
            middleware: self
                .inner
                .middleware
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            hooks: self.inner.hooks.counts(),
            errors: self
                .inner
                .errors
                .error_counts()
                .into_iter()
                .map(|(kind, count)| (kind.as_str(), count))
                .collect(),
        }
    }

    /// Start the background cache sweeper at the configured interval.
    pub fn start_cache_sweeper(&self) -> SweeperHandle {
        self.inner.cache.start_default_sweeper()
    }

    async fn before_control(&self, id: &JobId, event: HookEvent) -> Result<(), ClassifiedError> {
        let job = self
            .inner
            .jobs
            .get_job(id)
            .ok_or_else(|| JobError::NotFound(id.clone()))?;
        self.inner
            .hooks
            .trigger(event, HookContext::for_job(&job))
            .await;
        Ok(())
    }

    async fn after_control(&self, event: HookEvent, job: Job) -> Job {
        info!(job_id = %job.id, event = %event, status = %job.status, "job control applied");
        self.inner
            .hooks
            .trigger(event, HookContext::for_job(&job))
            .await;
        job
    }
}
