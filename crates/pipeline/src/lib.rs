//! `jobflow-pipeline`: typed job submission on top of `jobflow-jobs`.
//!
//! A [`PipelineManager`] maps job types to [`Processor`]s, runs an ordered
//! [`Middleware`] chain before each one, fires lifecycle [`HookEvent`]s and
//! classifies every failure through the shared `ErrorHandler`.

pub mod config;
pub mod error;
mod execution;
pub mod hooks;
pub mod manager;
pub mod processor;

pub use config::{EngineConfig, PipelineConfig};
pub use error::PipelineError;
pub use hooks::{HookContext, HookEvent, HookHandler, HookRegistry, hook_fn};
pub use manager::{
    CacheOptions, JobStatusView, PipelineManager, PipelineStats, ProcessOptions, ProcessOutcome,
};
pub use processor::{Middleware, Processor, middleware_fn, processor_fn};

/// Install logging from `config`. Safe to call more than once.
pub fn init_logging(config: &EngineConfig) {
    jobflow_observability::init_with(&config.log);
}
