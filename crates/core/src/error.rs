//! Classified error model.
//!
//! Every failure that leaves the engine (a job's recorded error, the rejection
//! returned to a caller, a batch item's error) is a [`ClassifiedError`]: a kind
//! from a small fixed taxonomy, a technical message, retry advice and a
//! message that is safe to show to an end user.

use core::any::Any;
use core::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy shared by every crate in the workspace.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input failed validation (bad payload, unknown job type, bad id).
    Validation,
    /// A remote call or connection failed.
    Network,
    /// Something the work needs is missing or exhausted.
    Resource,
    /// The work itself failed (OCR, translation, decoding).
    Processing,
    /// An operation exceeded its deadline.
    Timeout,
    /// Nothing more specific applies.
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Validation,
        ErrorKind::Network,
        ErrorKind::Resource,
        ErrorKind::Processing,
        ErrorKind::Timeout,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Resource => "resource",
            ErrorKind::Processing => "processing",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Display-safe text used when nothing more specific was supplied.
    pub fn default_user_message(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "The request contains invalid data.",
            ErrorKind::Network => "A network problem occurred. Please try again.",
            ErrorKind::Resource => "A required resource is unavailable.",
            ErrorKind::Processing => "The item could not be processed.",
            ErrorKind::Timeout => "The operation took too long. Please try again.",
            ErrorKind::Unknown => "An unexpected error occurred.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure carrying its kind and retry advice.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub retry_delay: Duration,
    pub user_message: String,
    /// Retry advice is final: [`ErrorHandler`](crate::ErrorHandler) passes
    /// the error through without consulting a strategy.
    #[serde(default)]
    pub pinned: bool,
}

impl ClassifiedError {
    /// Non-retryable error of `kind` with the kind's default user message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
            retry_delay: Duration::ZERO,
            user_message: kind.default_user_message().to_string(),
            pinned: false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Processing, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// The error reported for a job that was cancelled while someone waited on it.
    pub fn cancelled(job_id: impl fmt::Display) -> Self {
        Self::processing(format!("job {job_id} was cancelled"))
            .with_user_message("The operation was cancelled.")
            .pin()
    }

    pub fn with_retry(mut self, delay: Duration) -> Self {
        self.retryable = true;
        self.retry_delay = delay;
        self
    }

    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self.retry_delay = Duration::ZERO;
        self
    }

    /// Freeze the current retry advice.
    pub fn pin(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn with_user_message(mut self, user_message: impl Into<String>) -> Self {
        self.user_message = user_message.into();
        self
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = ClassifiedError::network("connection reset");
        assert_eq!(err.to_string(), "network error: connection reset");
        assert!(!err.retryable);
        assert_eq!(err.user_message, ErrorKind::Network.default_user_message());
    }

    #[test]
    fn cancelled_is_processing_and_final() {
        let err = ClassifiedError::cancelled("job_1");
        assert_eq!(err.kind, ErrorKind::Processing);
        assert!(!err.retryable);
        assert!(err.pinned);
        assert!(err.message.contains("cancelled"));
    }

    #[test]
    fn serializes_kind_in_snake_case() {
        let err = ClassifiedError::timeout("slow").with_retry(Duration::from_secs(2));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["retryable"], true);

        let back: ClassifiedError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
