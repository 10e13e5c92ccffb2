use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use jobflow_cache::{CacheManager, SetOptions};
use jobflow_core::{ClassifiedError, ErrorContext, ErrorHandler, panic_message};
use jobflow_jobs::JobContext;

use crate::hooks::{HookContext, HookEvent, HookRegistry};
use crate::manager::CacheOptions;
use crate::processor::{Middleware, Processor};

/// Everything one scheduled job needs, captured when it is submitted.
pub(crate) struct Execution {
    pub(crate) processor: Arc<dyn Processor>,
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
    pub(crate) hooks: Arc<HookRegistry>,
    pub(crate) errors: Arc<ErrorHandler>,
    pub(crate) cache: CacheManager<Value>,
    pub(crate) cache_options: Option<CacheOptions>,
    pub(crate) max_retries: u32,
}

impl Execution {
    pub(crate) async fn run(&self, payload: Value, ctx: JobContext) -> Result<Value, ClassifiedError> {
        let hook_ctx = HookContext::new(ctx.job_id().clone(), ctx.job_type());
        self.hooks
            .trigger(HookEvent::BeforeProcess, hook_ctx.clone().with_data(payload.clone()))
            .await;

        match self.execute(payload, &ctx).await {
            Ok(result) => {
                self.hooks
                    .trigger(HookEvent::AfterProcess, hook_ctx.with_result(result.clone()))
                    .await;
                Ok(result)
            }
            Err(error) => {
                self.hooks
                    .trigger(HookEvent::OnError, hook_ctx.with_error(error.clone()))
                    .await;
                Err(error)
            }
        }
    }

    async fn execute(&self, payload: Value, ctx: &JobContext) -> Result<Value, ClassifiedError> {
        let mut data = payload;
        for middleware in &self.middleware {
            data = match AssertUnwindSafe(middleware.handle(data, ctx))
                .catch_unwind()
                .await
            {
                Ok(handled) => handled.map_err(|err| self.classify(&err, ctx, "middleware", 0))?,
                Err(panic) => {
                    let err = anyhow::Error::new(panicked("middleware", &*panic));
                    return Err(self.classify(&err, ctx, "middleware", 0));
                }
            };
        }

        if let Some(options) = &self.cache_options {
            if let Some(hit) = self.cache.get(&options.key) {
                debug!(job_id = %ctx.job_id(), key = %options.key, "result served from cache");
                return Ok(hit);
            }
        }

        let mut retry_count = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(ClassifiedError::cancelled(ctx.job_id()));
            }

            let outcome = AssertUnwindSafe(self.processor.process(data.clone(), ctx))
                .catch_unwind()
                .await;
            let err = match outcome {
                Ok(Ok(result)) => {
                    if let Some(options) = &self.cache_options {
                        self.cache
                            .set(options.key.clone(), result.clone(), SetOptions::ttl(options.ttl));
                    }
                    return Ok(result);
                }
                Ok(Err(err)) => err,
                Err(panic) => anyhow::Error::new(panicked("processor", &*panic)),
            };

            let classified = self.classify(&err, ctx, "process", retry_count);
            if !classified.retryable || retry_count >= self.max_retries {
                return Err(classified);
            }

            retry_count += 1;
            warn!(
                job_id = %ctx.job_id(),
                job_type = %ctx.job_type(),
                retry = retry_count,
                max_retries = self.max_retries,
                delay_ms = classified.retry_delay.as_millis() as u64,
                "retrying processor"
            );
            tokio::select! {
                _ = ctx.cancelled() => return Err(ClassifiedError::cancelled(ctx.job_id())),
                _ = tokio::time::sleep(classified.retry_delay) => {}
            }
        }
    }

    fn classify(
        &self,
        err: &anyhow::Error,
        ctx: &JobContext,
        operation: &str,
        retry_count: u32,
    ) -> ClassifiedError {
        let error_ctx = ErrorContext::new(operation)
            .with_job(ctx.job_type(), ctx.job_id().as_str())
            .with_retry_count(retry_count);
        self.errors.classify(err, &error_ctx)
    }
}

/// A caught panic as a pinned, non-retryable Processing error.
fn panicked(stage: &str, panic: &(dyn std::any::Any + Send)) -> ClassifiedError {
    ClassifiedError::processing(format!("{stage} panicked: {}", panic_message(panic))).pin()
}
