//! Lifecycle hooks.
//!
//! Handlers for an event run one after another in registration order. A
//! handler that fails or panics is logged and skipped; it never aborts its
//! siblings or the operation that fired the event.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use jobflow_core::{ClassifiedError, JobId, panic_message};
use jobflow_jobs::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    BeforeCreate,
    AfterCreate,
    BeforeProcess,
    AfterProcess,
    OnError,
    OnComplete,
    OnFail,
    OnProgress,
    BeforeCancel,
    AfterCancel,
    BeforePause,
    AfterPause,
    BeforeResume,
    AfterResume,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeCreate => "before_create",
            HookEvent::AfterCreate => "after_create",
            HookEvent::BeforeProcess => "before_process",
            HookEvent::AfterProcess => "after_process",
            HookEvent::OnError => "on_error",
            HookEvent::OnComplete => "on_complete",
            HookEvent::OnFail => "on_fail",
            HookEvent::OnProgress => "on_progress",
            HookEvent::BeforeCancel => "before_cancel",
            HookEvent::AfterCancel => "after_cancel",
            HookEvent::BeforePause => "before_pause",
            HookEvent::AfterPause => "after_pause",
            HookEvent::BeforeResume => "before_resume",
            HookEvent::AfterResume => "after_resume",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook handler sees. Fields not relevant to the event are `None`.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub event: HookEvent,
    pub job_id: JobId,
    pub job_type: String,
    /// Snapshot of the job, when one exists yet.
    pub job: Option<Job>,
    /// Input payload (`BeforeCreate`, `BeforeProcess`).
    pub data: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<ClassifiedError>,
    pub progress: Option<u8>,
}

impl HookContext {
    pub fn new(job_id: JobId, job_type: impl Into<String>) -> Self {
        Self {
            event: HookEvent::BeforeCreate,
            job_id,
            job_type: job_type.into(),
            job: None,
            data: None,
            result: None,
            error: None,
            progress: None,
        }
    }

    pub fn for_job(job: &Job) -> Self {
        let mut ctx = Self::new(job.id.clone(), job.job_type.clone());
        ctx.job = Some(job.clone());
        ctx
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: ClassifiedError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn call(&self, ctx: &HookContext) -> anyhow::Result<()>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F> HookHandler for FnHook<F>
where
    F: Fn(HookContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
{
    async fn call(&self, ctx: &HookContext) -> anyhow::Result<()> {
        (self.0)(ctx.clone()).await
    }
}

/// Adapt an async closure into a hook handler.
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn HookHandler>
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHook(move |ctx| f(ctx).boxed()))
}

#[derive(Default)]
pub struct HookRegistry {
    handlers: RwLock<HashMap<HookEvent, Vec<Arc<dyn HookHandler>>>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("counts", &self.counts())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: HookEvent, handler: Arc<dyn HookHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push(handler);
    }

    /// Run every handler for `event` in order.
    pub async fn trigger(&self, event: HookEvent, mut ctx: HookContext) {
        ctx.event = event;
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .cloned()
            .unwrap_or_default();

        for (index, handler) in handlers.iter().enumerate() {
            match AssertUnwindSafe(handler.call(&ctx)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    event = %event,
                    job_id = %ctx.job_id,
                    handler = index,
                    error = %format!("{err:#}"),
                    "hook handler failed"
                ),
                Err(panic) => warn!(
                    event = %event,
                    job_id = %ctx.job_id,
                    handler = index,
                    panic = %panic_message(&*panic),
                    "hook handler panicked"
                ),
            }
        }
    }

    pub fn counts(&self) -> BTreeMap<HookEvent, usize> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(event, list)| (*event, list.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<dyn HookHandler> {
        let log = Arc::clone(log);
        hook_fn(move |ctx: HookContext| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{tag}:{}", ctx.event));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(HookEvent::AfterCreate, recorder(&log, "a"));
        registry.register(HookEvent::AfterCreate, recorder(&log, "b"));
        registry.register(HookEvent::OnError, recorder(&log, "c"));

        registry
            .trigger(HookEvent::AfterCreate, HookContext::new(JobId::generate(), "t"))
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:after_create".to_string(), "b:after_create".to_string()]
        );
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_isolated() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(
            HookEvent::AfterProcess,
            hook_fn(|_| async { Err(anyhow::anyhow!("hook broke")) }),
        );
        registry.register(
            HookEvent::AfterProcess,
            hook_fn(|_| async { panic!("hook exploded") }),
        );
        registry.register(HookEvent::AfterProcess, recorder(&log, "last"));

        registry
            .trigger(HookEvent::AfterProcess, HookContext::new(JobId::generate(), "t"))
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["last:after_process".to_string()]);
    }

    #[test]
    fn counts_only_events_with_handlers() {
        let registry = HookRegistry::new();
        registry.register(HookEvent::OnFail, hook_fn(|_| async { Ok(()) }));
        registry.register(HookEvent::OnFail, hook_fn(|_| async { Ok(()) }));

        let counts = registry.counts();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[&HookEvent::OnFail], 2);
    }
}
