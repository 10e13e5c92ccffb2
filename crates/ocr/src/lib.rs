//! `jobflow-ocr`: OCR followed by translation, for single images and batches.
//!
//! Engines are external: implement [`OcrEngine`] and [`TranslationEngine`]
//! and register them on an [`OcrTranslationPipeline`]. The pipeline can run
//! directly or as job processors on a `PipelineManager`
//! (see [`OcrTranslationPipeline::register_processors`]).

pub mod config;
pub mod engine;
pub mod events;
pub mod pipeline;
pub mod processors;
pub mod registry;

pub use config::OcrPipelineConfig;
pub use engine::{
    Engine, EngineCapabilities, ImageSource, OcrEngine, OcrResult, RecognizeOptions, TextBlock,
    TranslateOptions, TranslationEngine, TranslationResult,
};
pub use events::{BatchProgress, PipelineEvent, PipelineObserver, Stage, TracingObserver};
pub use pipeline::{
    BatchOptions, BatchOutcome, OcrTranslationOutcome, OcrTranslationPipeline, ProcessImageOptions,
};
pub use processors::{OCR_JOB, OCR_TRANSLATE_JOB, TRANSLATE_JOB};
pub use registry::{AUTO, EngineRegistry, SelectionCriteria, SelectionError};
