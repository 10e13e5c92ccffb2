//! Two-stage image pipeline: recognize text, then translate it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobflow_cache::{CacheManager, SetOptions};
use jobflow_core::{BatchId, ClassifiedError, ErrorContext, ErrorHandler, JobId, panic_message};
use jobflow_pipeline::PipelineManager;

use crate::config::OcrPipelineConfig;
use crate::engine::{
    ImageSource, OcrEngine, OcrResult, RecognizeOptions, TranslateOptions, TranslationEngine,
    TranslationResult, sha256_hex,
};
use crate::events::{BatchProgress, PipelineEvent, PipelineObserver, Stage, TracingObserver};
use crate::registry::{EngineRegistry, SelectionCriteria};

/// Per-call overrides; `None` falls back to [`OcrPipelineConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessImageOptions {
    #[serde(skip)]
    pub job_id: Option<JobId>,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
    pub ocr_engine: Option<String>,
    pub translation_engine: Option<String>,
    pub high_quality: Option<bool>,
    /// Only offline engines qualify for `auto` selection.
    pub offline: bool,
    /// Neither read nor write the result cache.
    pub skip_cache: bool,
}

impl ProcessImageOptions {
    pub fn with_job_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn with_languages(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source_language = Some(source.into());
        self.target_language = Some(target.into());
        self
    }

    pub fn with_engines(mut self, ocr: impl Into<String>, translation: impl Into<String>) -> Self {
        self.ocr_engine = Some(ocr.into());
        self.translation_engine = Some(translation.into());
        self
    }

    pub fn with_high_quality(mut self, high_quality: bool) -> Self {
        self.high_quality = Some(high_quality);
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub batch_id: Option<BatchId>,
    /// Falls back to `OcrPipelineConfig::concurrency`.
    pub concurrency: Option<usize>,
    /// Applied to every image; item job ids are derived from the batch id.
    pub item: ProcessImageOptions,
}

impl BatchOptions {
    pub fn with_batch_id(mut self, id: BatchId) -> Self {
        self.batch_id = Some(id);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_item(mut self, item: ProcessImageOptions) -> Self {
        self.item = item;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrTranslationOutcome {
    pub job_id: JobId,
    pub ocr_result: OcrResult,
    /// `None` when no text was recognized.
    pub translation_result: Option<TranslationResult>,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    /// One slot per input image; `None` where the image failed.
    pub results: Vec<Option<OcrTranslationOutcome>>,
    /// One slot per input image; set where the image failed.
    pub errors: Vec<Option<ClassifiedError>>,
    pub success: bool,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.results.iter().flatten().count()
    }

    pub fn failed(&self) -> usize {
        self.errors.iter().flatten().count()
    }
}

/// Options with every default applied.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub(crate) job_id: JobId,
    pub(crate) source_language: String,
    pub(crate) target_language: String,
    pub(crate) ocr_engine: String,
    pub(crate) translation_engine: String,
    pub(crate) high_quality: bool,
    pub(crate) offline: bool,
    pub(crate) skip_cache: bool,
}

struct Inner {
    config: OcrPipelineConfig,
    ocr: EngineRegistry<dyn OcrEngine>,
    translation: EngineRegistry<dyn TranslationEngine>,
    cache: CacheManager<Value>,
    errors: Arc<ErrorHandler>,
    observers: RwLock<Vec<Arc<dyn PipelineObserver>>>,
}

/// Cheap-to-clone handle over shared engines, cache and observers.
#[derive(Clone)]
pub struct OcrTranslationPipeline {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OcrTranslationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrTranslationPipeline")
            .field("config", &self.inner.config)
            .field("ocr", &self.inner.ocr)
            .field("translation", &self.inner.translation)
            .finish_non_exhaustive()
    }
}

impl OcrTranslationPipeline {
    pub fn new(config: OcrPipelineConfig) -> Self {
        Self::with_parts(config, CacheManager::default(), Arc::new(ErrorHandler::new()))
    }

    /// Share the cache and error handler of `manager`.
    pub fn for_manager(config: OcrPipelineConfig, manager: &PipelineManager) -> Self {
        Self::with_parts(
            config,
            manager.cache().clone(),
            Arc::clone(manager.error_handler()),
        )
    }

    pub fn with_parts(
        config: OcrPipelineConfig,
        cache: CacheManager<Value>,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        let config = OcrPipelineConfig {
            concurrency: config.concurrency.max(1),
            ..config
        };
        let sweeping = cache.ensure_sweeper();
        info!(
            concurrency = config.concurrency,
            sweeping,
            ocr_engine = %config.ocr_engine,
            translation_engine = %config.translation_engine,
            "ocr translation pipeline created"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                ocr: EngineRegistry::new("ocr"),
                translation: EngineRegistry::new("translation"),
                cache,
                errors,
                observers: RwLock::new(vec![Arc::new(TracingObserver) as Arc<dyn PipelineObserver>]),
            }),
        }
    }

    pub fn config(&self) -> &OcrPipelineConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &CacheManager<Value> {
        &self.inner.cache
    }

    pub fn ocr_engines(&self) -> &EngineRegistry<dyn OcrEngine> {
        &self.inner.ocr
    }

    pub fn translation_engines(&self) -> &EngineRegistry<dyn TranslationEngine> {
        &self.inner.translation
    }

    pub fn register_ocr_engine(&self, engine: Arc<dyn OcrEngine>) {
        self.inner.ocr.register(engine);
    }

    pub fn register_translation_engine(&self, engine: Arc<dyn TranslationEngine>) {
        self.inner.translation.register(engine);
    }

    pub fn add_observer(&self, observer: Arc<dyn PipelineObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Recognize and translate one image.
    pub async fn process(
        &self,
        image: &ImageSource,
        options: ProcessImageOptions,
    ) -> Result<OcrTranslationOutcome, ClassifiedError> {
        self.process_with_token(image, options, &CancellationToken::new())
            .await
    }

    /// [`process`](Self::process), stopping between stages once `token` is
    /// cancelled.
    pub async fn process_with_token(
        &self,
        image: &ImageSource,
        options: ProcessImageOptions,
        token: &CancellationToken,
    ) -> Result<OcrTranslationOutcome, ClassifiedError> {
        let settings = self.resolve(options);
        let job_id = settings.job_id.clone();
        info!(job_id = %job_id, image = %image, "processing image");
        self.emit(&PipelineEvent::ProcessStarted {
            job_id: job_id.clone(),
        });

        match self.run_stages(image, &settings, token).await {
            Ok(outcome) => {
                self.emit(&PipelineEvent::ProcessCompleted {
                    job_id,
                    stage: outcome.stage,
                });
                Ok(outcome)
            }
            Err(error) => {
                self.emit(&PipelineEvent::ProcessFailed {
                    job_id,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Translate already extracted text.
    pub async fn translate_text(
        &self,
        text: &str,
        options: ProcessImageOptions,
    ) -> Result<TranslationResult, ClassifiedError> {
        let settings = self.resolve(options);
        let source = settings.source_language.clone();
        self.translation_stage(text, &source, &settings, &CancellationToken::new())
            .await
    }

    /// Process `images` in chunks of `concurrency`. One image failing never
    /// stops the others.
    pub async fn process_batch(&self, images: &[ImageSource], options: BatchOptions) -> BatchOutcome {
        self.process_batch_with_token(images, options, &CancellationToken::new())
            .await
    }

    pub async fn process_batch_with_token(
        &self,
        images: &[ImageSource],
        options: BatchOptions,
        token: &CancellationToken,
    ) -> BatchOutcome {
        let batch_id = options.batch_id.clone().unwrap_or_else(BatchId::generate);
        let total = images.len();
        let concurrency = options
            .concurrency
            .unwrap_or(self.inner.config.concurrency)
            .max(1);
        self.emit(&PipelineEvent::BatchStarted {
            batch_id: batch_id.clone(),
            total,
        });

        let mut results = Vec::with_capacity(total);
        let mut errors = Vec::with_capacity(total);
        let mut processed = 0;

        for (chunk_index, chunk) in images.chunks(concurrency).enumerate() {
            let runs = chunk.iter().enumerate().map(|(offset, image)| {
                let index = chunk_index * concurrency + offset;
                let job_id = batch_id.item_job_id(index);
                let item = options.item.clone().with_job_id(job_id.clone());
                let batch_id = &batch_id;
                async move {
                    self.emit(&PipelineEvent::BatchItemStarted {
                        batch_id: batch_id.clone(),
                        job_id: job_id.clone(),
                        index,
                        total,
                    });
                    let outcome = self.process_with_token(image, item, token).await;
                    if let Err(err) = &outcome {
                        error!(batch_id = %batch_id, index, error = %err, "batch image failed");
                    }
                    self.emit(&PipelineEvent::BatchItemFinished {
                        batch_id: batch_id.clone(),
                        job_id,
                        index,
                        total,
                        success: outcome.is_ok(),
                    });
                    outcome
                }
            });

            for outcome in join_all(runs).await {
                match outcome {
                    Ok(outcome) => {
                        results.push(Some(outcome));
                        errors.push(None);
                    }
                    Err(err) => {
                        results.push(None);
                        errors.push(Some(err));
                    }
                }
            }

            processed += chunk.len();
            self.emit(&PipelineEvent::BatchProgress(BatchProgress {
                batch_id: batch_id.clone(),
                processed,
                total,
                errors: errors.iter().flatten().count(),
            }));
        }

        let failed = errors.iter().flatten().count();
        self.emit(&PipelineEvent::BatchCompleted {
            batch_id: batch_id.clone(),
            total,
            succeeded: total - failed,
            failed,
        });
        BatchOutcome {
            batch_id,
            results,
            errors,
            success: failed == 0,
        }
    }

    pub(crate) fn resolve(&self, options: ProcessImageOptions) -> Resolved {
        let config = &self.inner.config;
        Resolved {
            job_id: options.job_id.unwrap_or_else(JobId::generate),
            source_language: options
                .source_language
                .unwrap_or_else(|| config.source_language.clone()),
            target_language: options
                .target_language
                .unwrap_or_else(|| config.target_language.clone()),
            ocr_engine: options
                .ocr_engine
                .unwrap_or_else(|| config.ocr_engine.clone()),
            translation_engine: options
                .translation_engine
                .unwrap_or_else(|| config.translation_engine.clone()),
            high_quality: options.high_quality.unwrap_or(config.high_quality),
            offline: options.offline,
            skip_cache: options.skip_cache,
        }
    }

    async fn run_stages(
        &self,
        image: &ImageSource,
        settings: &Resolved,
        token: &CancellationToken,
    ) -> Result<OcrTranslationOutcome, ClassifiedError> {
        let ocr_result = self.ocr_stage(image, settings, token).await?;
        if !ocr_result.has_text() {
            warn!(job_id = %settings.job_id, "no text recognized");
            return Ok(OcrTranslationOutcome {
                job_id: settings.job_id.clone(),
                ocr_result,
                translation_result: None,
                stage: Stage::Ocr,
                message: Some("No text to translate".to_string()),
            });
        }

        let source = ocr_result
            .language
            .clone()
            .filter(|lang| !lang.trim().is_empty())
            .unwrap_or_else(|| settings.source_language.clone());
        let translation = self
            .translation_stage(&ocr_result.text, &source, settings, token)
            .await?;

        Ok(OcrTranslationOutcome {
            job_id: settings.job_id.clone(),
            ocr_result,
            translation_result: Some(translation),
            stage: Stage::Translation,
            message: None,
        })
    }

    pub(crate) async fn ocr_stage(
        &self,
        image: &ImageSource,
        settings: &Resolved,
        token: &CancellationToken,
    ) -> Result<OcrResult, ClassifiedError> {
        check_cancelled(token, &settings.job_id)?;
        let criteria = SelectionCriteria {
            language: settings.source_language.clone(),
            offline: settings.offline,
            high_quality: settings.high_quality,
        };
        let engine = self.inner.ocr.select(&settings.ocr_engine, &criteria)?;
        let engine_name = engine.name().to_string();
        self.emit(&PipelineEvent::OcrStarted {
            job_id: settings.job_id.clone(),
            engine: engine_name.clone(),
            language: settings.source_language.clone(),
        });

        let key = format!(
            "ocr:{}:{}:{}",
            engine_name,
            settings.source_language,
            image.fingerprint()
        );
        let cached = if settings.skip_cache {
            None
        } else {
            self.cached::<OcrResult>(&key)
        };

        let (result, from_cache) = match cached {
            Some(hit) => (hit, true),
            None => {
                let options = RecognizeOptions {
                    language: settings.source_language.clone(),
                };
                let recognized = tokio::select! {
                    _ = token.cancelled() => return Err(ClassifiedError::cancelled(&settings.job_id)),
                    recognized = engine.recognize(image, &options) => recognized,
                };
                let result = recognized.map_err(|err| self.classify(&err, "ocr", &settings.job_id))?;
                if !settings.skip_cache {
                    self.store(key, &result, self.inner.config.ocr_cache_ttl);
                }
                (result, false)
            }
        };

        self.emit(&PipelineEvent::OcrCompleted {
            job_id: settings.job_id.clone(),
            engine: engine_name,
            confidence: result.confidence,
            text_length: result.text.chars().count(),
            cached: from_cache,
        });
        Ok(result)
    }

    pub(crate) async fn translation_stage(
        &self,
        text: &str,
        source: &str,
        settings: &Resolved,
        token: &CancellationToken,
    ) -> Result<TranslationResult, ClassifiedError> {
        check_cancelled(token, &settings.job_id)?;
        let criteria = SelectionCriteria {
            language: source.to_string(),
            offline: settings.offline,
            high_quality: settings.high_quality,
        };
        let engine = self
            .inner
            .translation
            .select(&settings.translation_engine, &criteria)?;
        let engine_name = engine.name().to_string();
        let target = settings.target_language.as_str();
        self.emit(&PipelineEvent::TranslationStarted {
            job_id: settings.job_id.clone(),
            engine: engine_name.clone(),
            source_language: source.to_string(),
            target_language: target.to_string(),
            text_length: text.chars().count(),
        });

        let key = format!(
            "translation:{}:{}:{}:{}",
            engine_name,
            source,
            target,
            sha256_hex(text.as_bytes())
        );
        let cached = if settings.skip_cache {
            None
        } else {
            self.cached::<TranslationResult>(&key)
        };

        let (result, from_cache) = match cached {
            Some(hit) => (hit, true),
            None => {
                let options = TranslateOptions {
                    high_quality: settings.high_quality,
                };
                let translated = tokio::select! {
                    _ = token.cancelled() => return Err(ClassifiedError::cancelled(&settings.job_id)),
                    translated = engine.translate(text, source, target, &options) => translated,
                };
                let result = translated
                    .map_err(|err| self.classify(&err, "translation", &settings.job_id))?;
                if !settings.skip_cache {
                    self.store(key, &result, self.inner.config.translation_cache_ttl);
                }
                (result, false)
            }
        };

        self.emit(&PipelineEvent::TranslationCompleted {
            job_id: settings.job_id.clone(),
            engine: engine_name,
            source_language: result.source_language.clone(),
            target_language: target.to_string(),
            text_length: result.translated_text.chars().count(),
            cached: from_cache,
        });
        Ok(result)
    }

    fn classify(&self, err: &anyhow::Error, operation: &str, job_id: &JobId) -> ClassifiedError {
        let ctx = ErrorContext::new(operation).with_job("ocr_translate", job_id.as_str());
        self.inner.errors.classify(err, &ctx)
    }

    fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.inner.cache.get(key)?;
        match serde_json::from_value(value) {
            Ok(hit) => {
                debug!(key, "cache hit");
                Some(hit)
            }
            Err(err) => {
                warn!(key, error = %err, "dropping unreadable cache entry");
                self.inner.cache.delete(key);
                None
            }
        }
    }

    fn store<T: Serialize>(&self, key: String, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(value) => self.inner.cache.set(key, value, SetOptions::ttl(ttl)),
            Err(err) => warn!(key = %key, error = %err, "result not cached"),
        }
    }

    fn emit(&self, event: &PipelineEvent) {
        let observers = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(event))) {
                warn!(panic = %panic_message(&*panic), "pipeline observer panicked");
            }
        }
    }
}

fn check_cancelled(token: &CancellationToken, job_id: &JobId) -> Result<(), ClassifiedError> {
    if token.is_cancelled() {
        return Err(ClassifiedError::cancelled(job_id));
    }
    Ok(())
}
