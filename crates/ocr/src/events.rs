//! Progress events emitted by the OCR/translation pipeline.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use jobflow_core::{BatchId, ClassifiedError, JobId};

/// Stage at which a single image finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// No text was found, so nothing was translated.
    Ocr,
    Translation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub batch_id: BatchId,
    pub processed: usize,
    pub total: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    ProcessStarted {
        job_id: JobId,
    },
    OcrStarted {
        job_id: JobId,
        engine: String,
        language: String,
    },
    OcrCompleted {
        job_id: JobId,
        engine: String,
        confidence: f32,
        text_length: usize,
        cached: bool,
    },
    TranslationStarted {
        job_id: JobId,
        engine: String,
        source_language: String,
        target_language: String,
        text_length: usize,
    },
    TranslationCompleted {
        job_id: JobId,
        engine: String,
        source_language: String,
        target_language: String,
        text_length: usize,
        cached: bool,
    },
    ProcessCompleted {
        job_id: JobId,
        stage: Stage,
    },
    ProcessFailed {
        job_id: JobId,
        error: ClassifiedError,
    },
    BatchStarted {
        batch_id: BatchId,
        total: usize,
    },
    BatchItemStarted {
        batch_id: BatchId,
        job_id: JobId,
        index: usize,
        total: usize,
    },
    BatchItemFinished {
        batch_id: BatchId,
        job_id: JobId,
        index: usize,
        total: usize,
        success: bool,
    },
    BatchProgress(BatchProgress),
    BatchCompleted {
        batch_id: BatchId,
        total: usize,
        succeeded: usize,
        failed: usize,
    },
}

/// Receives pipeline events synchronously, on the task that produced them.
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::ProcessFailed { job_id, error } => {
                warn!(job_id = %job_id, kind = %error.kind, error = %error.message, "image processing failed");
            }
            PipelineEvent::BatchStarted { batch_id, total } => {
                info!(batch_id = %batch_id, total, "batch started");
            }
            PipelineEvent::BatchCompleted {
                batch_id,
                total,
                succeeded,
                failed,
            } => {
                info!(batch_id = %batch_id, total, succeeded, failed, "batch completed");
            }
            PipelineEvent::BatchProgress(progress) => {
                info!(
                    batch_id = %progress.batch_id,
                    processed = progress.processed,
                    total = progress.total,
                    errors = progress.errors,
                    "batch progress"
                );
            }
            other => debug!(event = ?other, "pipeline event"),
        }
    }
}
