//! Job processors that expose the OCR pipeline through a `PipelineManager`.
//!
//! | job type        | payload                                   | result                  |
//! |-----------------|-------------------------------------------|-------------------------|
//! | `ocr`           | `{ "image": ImageSource, ..options }`     | `OcrResult`             |
//! | `translate`     | `{ "text": "...", ..options }`            | `TranslationResult`     |
//! | `ocr_translate` | `{ "image": ImageSource, ..options }`     | `OcrTranslationOutcome` |
//!
//! `options` are the `ProcessImageOptions` fields; the job id comes from the
//! running job.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use jobflow_core::ClassifiedError;
use jobflow_jobs::JobContext;
use jobflow_pipeline::{PipelineManager, Processor};

use crate::engine::ImageSource;
use crate::pipeline::{OcrTranslationPipeline, ProcessImageOptions};

pub const OCR_JOB: &str = "ocr";
pub const TRANSLATE_JOB: &str = "translate";
pub const OCR_TRANSLATE_JOB: &str = "ocr_translate";

#[derive(Debug, Deserialize)]
struct ImagePayload {
    image: ImageSource,
    #[serde(flatten)]
    options: ProcessImageOptions,
}

#[derive(Debug, Deserialize)]
struct TextPayload {
    text: String,
    #[serde(flatten)]
    options: ProcessImageOptions,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Ocr,
    Translate,
    OcrTranslate,
}

struct OcrJob {
    pipeline: OcrTranslationPipeline,
    mode: Mode,
}

#[async_trait]
impl Processor for OcrJob {
    async fn process(&self, data: Value, ctx: &JobContext) -> anyhow::Result<Value> {
        let token = ctx.cancellation_token();
        let value = match self.mode {
            Mode::Ocr => {
                let payload: ImagePayload = parse(data, ctx)?;
                let settings = self
                    .pipeline
                    .resolve(payload.options.with_job_id(ctx.job_id().clone()));
                let result = self.pipeline.ocr_stage(&payload.image, &settings, token).await?;
                serde_json::to_value(result)?
            }
            Mode::Translate => {
                let payload: TextPayload = parse(data, ctx)?;
                let settings = self
                    .pipeline
                    .resolve(payload.options.with_job_id(ctx.job_id().clone()));
                let source = settings.source_language.clone();
                let result = self
                    .pipeline
                    .translation_stage(&payload.text, &source, &settings, token)
                    .await?;
                serde_json::to_value(result)?
            }
            Mode::OcrTranslate => {
                let payload: ImagePayload = parse(data, ctx)?;
                let options = payload.options.with_job_id(ctx.job_id().clone());
                let outcome = self
                    .pipeline
                    .process_with_token(&payload.image, options, token)
                    .await?;
                serde_json::to_value(outcome)?
            }
        };
        Ok(value)
    }
}

fn parse<T: DeserializeOwned>(data: Value, ctx: &JobContext) -> Result<T, ClassifiedError> {
    serde_json::from_value(data).map_err(|err| {
        ClassifiedError::validation(format!("invalid {} payload: {err}", ctx.job_type()))
    })
}

impl OcrTranslationPipeline {
    /// Register the `ocr`, `translate` and `ocr_translate` processors.
    pub fn register_processors(&self, manager: &PipelineManager) {
        for (job_type, mode) in [
            (OCR_JOB, Mode::Ocr),
            (TRANSLATE_JOB, Mode::Translate),
            (OCR_TRANSLATE_JOB, Mode::OcrTranslate),
        ] {
            manager.register_processor(
                job_type,
                Arc::new(OcrJob {
                    pipeline: self.clone(),
                    mode,
                }),
            );
        }
    }
}
