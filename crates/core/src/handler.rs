//! Error classification and recovery strategies.
//!
//! [`ErrorHandler`] turns an arbitrary `anyhow::Error` into a
//! [`ClassifiedError`] and attaches retry advice from the strategy registered
//! for its kind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ClassifiedError, ErrorKind};
use crate::retry::RetryPolicy;

/// Where an error happened. Every field is optional so call sites fill in
/// what they know.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub job_type: Option<String>,
    pub job_id: Option<String>,
    /// Retries already performed for this unit of work.
    pub retry_count: u32,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Self::default()
        }
    }

    pub fn with_job(mut self, job_type: impl Into<String>, job_id: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Outcome of handling one error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlingResult {
    /// `false` when no strategy or fallback applied.
    pub handled: bool,
    pub error: ClassifiedError,
}

impl HandlingResult {
    pub fn handled(error: ClassifiedError) -> Self {
        Self {
            handled: true,
            error,
        }
    }

    pub fn unhandled(error: ClassifiedError) -> Self {
        Self {
            handled: false,
            error,
        }
    }
}

/// Recovery strategy for one error kind.
pub type Strategy = Arc<dyn Fn(&ClassifiedError, &ErrorContext) -> HandlingResult + Send + Sync>;

/// Build a strategy that applies `policy` using the context's retry count.
pub fn policy_strategy(policy: RetryPolicy) -> Strategy {
    Arc::new(move |error, ctx| HandlingResult::handled(policy.advise(error.clone(), ctx.retry_count)))
}

/// Classifies errors and applies per-kind strategies.
pub struct ErrorHandler {
    strategies: RwLock<HashMap<ErrorKind, Strategy>>,
    on_error: RwLock<Option<Strategy>>,
    error_counts: Mutex<HashMap<ErrorKind, u64>>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<ErrorKind> = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        f.debug_struct("ErrorHandler")
            .field("strategies", &kinds)
            .finish_non_exhaustive()
    }
}

impl ErrorHandler {
    /// Handler with the default strategy for every kind.
    pub fn new() -> Self {
        let handler = Self::bare();
        for kind in ErrorKind::ALL {
            handler.register_strategy(kind, policy_strategy(default_policy(kind)));
        }
        handler
    }

    /// Handler with no strategies registered.
    pub fn bare() -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            on_error: RwLock::new(None),
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the strategy used for `kind`.
    pub fn register_strategy(&self, kind: ErrorKind, strategy: Strategy) {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, strategy);
    }

    /// Fallback used when no per-kind strategy exists.
    pub fn set_on_error(&self, strategy: Strategy) {
        *self.on_error.write().unwrap_or_else(PoisonError::into_inner) = Some(strategy);
    }

    /// Classify and handle `error`, returning the classified form.
    pub fn classify(&self, error: &anyhow::Error, ctx: &ErrorContext) -> ClassifiedError {
        self.handle_error(error, ctx).error
    }

    /// Classify `error` and run the matching strategy.
    ///
    /// A [`ClassifiedError`] found in the chain keeps its kind and message,
    /// but its retry advice is recomputed for `ctx` unless it is pinned.
    pub fn handle_error(&self, error: &anyhow::Error, ctx: &ErrorContext) -> HandlingResult {
        if let Some(explicit) = find_classified(error) {
            if explicit.pinned {
                self.count(explicit.kind);
                debug!(
                    kind = %explicit.kind,
                    operation = ?ctx.operation,
                    job_id = ?ctx.job_id,
                    "pinned error passed through"
                );
                return HandlingResult::handled(explicit.clone());
            }
            return self.handle_classified(explicit.clone(), ctx);
        }

        let kind = error_kind_of(error);
        self.handle_classified(ClassifiedError::new(kind, format!("{error:#}")), ctx)
    }

    /// Run the strategy for an already classified error.
    pub fn handle_classified(&self, error: ClassifiedError, ctx: &ErrorContext) -> HandlingResult {
        self.count(error.kind);

        let strategy = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&error.kind)
            .cloned()
            .or_else(|| {
                self.on_error
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            });

        let result = match strategy {
            Some(strategy) => strategy(&error, ctx),
            None => HandlingResult::unhandled(error.not_retryable()),
        };

        warn!(
            kind = %result.error.kind,
            operation = ?ctx.operation,
            job_type = ?ctx.job_type,
            job_id = ?ctx.job_id,
            retry_count = ctx.retry_count,
            retryable = result.error.retryable,
            handled = result.handled,
            error = %result.error.message,
            "error classified"
        );

        result
    }

    /// Run `f`, converting a failure into its handling result.
    pub fn wrap<T>(
        &self,
        ctx: &ErrorContext,
        f: impl FnOnce() -> anyhow::Result<T>,
    ) -> Result<T, HandlingResult> {
        f().map_err(|err| self.handle_error(&err, ctx))
    }

    /// Await `fut`, converting a failure into its handling result.
    pub async fn wrap_async<T, F>(&self, ctx: &ErrorContext, fut: F) -> Result<T, HandlingResult>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        fut.await.map_err(|err| self.handle_error(&err, ctx))
    }

    /// Number of errors seen per kind since construction.
    pub fn error_counts(&self) -> HashMap<ErrorKind, u64> {
        self.error_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn count(&self, kind: ErrorKind) {
        *self
            .error_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_insert(0) += 1;
    }
}

/// Retry policy installed for `kind` by [`ErrorHandler::new`].
pub fn default_policy(kind: ErrorKind) -> RetryPolicy {
    match kind {
        ErrorKind::Network => RetryPolicy::fixed(Duration::from_secs(1)),
        ErrorKind::Timeout => RetryPolicy::fixed(Duration::from_secs(2)),
        ErrorKind::Processing => {
            RetryPolicy::exponential(3, Duration::from_millis(500), Duration::from_secs(60))
        }
        ErrorKind::Validation | ErrorKind::Resource | ErrorKind::Unknown => RetryPolicy::no_retry(),
    }
}

fn find_classified(error: &anyhow::Error) -> Option<&ClassifiedError> {
    error
        .downcast_ref::<ClassifiedError>()
        .or_else(|| error.chain().find_map(|e| e.downcast_ref::<ClassifiedError>()))
}

/// Kind of `error`: an explicit [`ErrorKind`] context tag wins, otherwise the
/// chain text is matched.
pub fn error_kind_of(error: &anyhow::Error) -> ErrorKind {
    if let Some(classified) = find_classified(error) {
        return classified.kind;
    }
    if let Some(kind) = error.downcast_ref::<ErrorKind>() {
        return *kind;
    }
    classify_message(&format!("{error:#}"))
}

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline"];
const NETWORK_MARKERS: &[&str] = &[
    "network",
    "connection",
    "econnrefused",
    "socket",
    "dns",
    "unreachable",
];
const VALIDATION_MARKERS: &[&str] = &["validation", "invalid", "required", "must be"];
const RESOURCE_MARKERS: &[&str] = &[
    "not found",
    "out of memory",
    "quota",
    "resource",
    "permission",
    "no space",
];
const PROCESSING_MARKERS: &[&str] = &["ocr", "translation", "processing", "decode", "recognition"];

/// Kind inferred from free-form error text (case-insensitive).
pub fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_lowercase();
    let table: [(&[&str], ErrorKind); 5] = [
        (TIMEOUT_MARKERS, ErrorKind::Timeout),
        (NETWORK_MARKERS, ErrorKind::Network),
        (VALIDATION_MARKERS, ErrorKind::Validation),
        (RESOURCE_MARKERS, ErrorKind::Resource),
        (PROCESSING_MARKERS, ErrorKind::Processing),
    ];
    table
        .iter()
        .find(|(markers, _)| markers.iter().any(|m| message.contains(m)))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}
