//! Processors and middleware.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use jobflow_jobs::JobContext;

/// Does the work for one job type.
///
/// Return an `anyhow::Error`; the pipeline classifies it. Attach a
/// `ClassifiedError` (or an `ErrorKind` context) to control the kind.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, data: Value, ctx: &JobContext) -> anyhow::Result<Value>;
}

/// Transforms the payload before it reaches the processor.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, data: Value, ctx: &JobContext) -> anyhow::Result<Value>;
}

type BoxedFn = dyn Fn(Value, JobContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

struct FnStage(Box<BoxedFn>);

#[async_trait]
impl Processor for FnStage {
    async fn process(&self, data: Value, ctx: &JobContext) -> anyhow::Result<Value> {
        (self.0)(data, ctx.clone()).await
    }
}

#[async_trait]
impl Middleware for FnStage {
    async fn handle(&self, data: Value, ctx: &JobContext) -> anyhow::Result<Value> {
        (self.0)(data, ctx.clone()).await
    }
}

fn stage<F, Fut>(f: F) -> FnStage
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnStage(Box::new(move |data, ctx| f(data, ctx).boxed()))
}

/// Adapt an async closure into a [`Processor`].
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(stage(f))
}

/// Adapt an async closure into a [`Middleware`].
pub fn middleware_fn<F, Fut>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(stage(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    #[tokio::test]
    async fn closures_adapt_to_both_traits() {
        let ctx = JobContext::detached("echo", Map::new());
        let processor = processor_fn(|data, _ctx| async move { Ok(json!({ "echo": data })) });
        let middleware = middleware_fn(|data, ctx: JobContext| async move {
            Ok(json!({ "type": ctx.job_type(), "inner": data }))
        });

        let wrapped = middleware.handle(json!(1), &ctx).await.unwrap();
        assert_eq!(wrapped, json!({ "type": "echo", "inner": 1 }));

        let out = processor.process(wrapped, &ctx).await.unwrap();
        assert_eq!(out["echo"]["inner"], 1);
    }
}
