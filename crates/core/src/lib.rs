//! `jobflow-core`: shared building blocks for the job-pipeline engine.
//!
//! This crate holds the pieces every other crate leans on: identifiers, the
//! classified error taxonomy, retry policies and the `ErrorHandler` that turns
//! raw failures into classified ones.

pub mod error;
pub mod handler;
pub mod id;
pub mod retry;

pub use error::{ClassifiedError, ErrorKind, panic_message};
pub use handler::{
    ErrorContext, ErrorHandler, HandlingResult, Strategy, classify_message, default_policy,
    error_kind_of, policy_strategy,
};
pub use id::{BatchId, JobId};
pub use retry::{BackoffStrategy, RetryPolicy};
