use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobflow_core::{BatchId, ErrorKind, JobId, RetryPolicy, policy_strategy};
use jobflow_ocr::{
    AUTO, BatchOptions, Engine, EngineCapabilities, ImageSource, OCR_TRANSLATE_JOB, OcrEngine,
    OcrPipelineConfig, OcrResult, OcrTranslationOutcome, OcrTranslationPipeline, PipelineEvent,
    PipelineObserver, ProcessImageOptions, RecognizeOptions, Stage, TRANSLATE_JOB,
    TranslateOptions, TranslationEngine, TranslationResult,
};
use jobflow_pipeline::{PipelineConfig, PipelineManager, ProcessOptions};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Reads the image bytes as the recognized text. `fail` fails, `boom`
/// reports a missing model, empty bytes yield no text.
#[derive(Default)]
struct FakeOcr {
    calls: AtomicUsize,
}

impl Engine for FakeOcr {
    fn name(&self) -> &str {
        "fake-ocr"
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            offline: true,
            high_quality: false,
            languages: vec!["ja".into(), "en".into()],
        }
    }
}

#[async_trait]
impl OcrEngine for FakeOcr {
    async fn recognize(
        &self,
        image: &ImageSource,
        _options: &RecognizeOptions,
    ) -> anyhow::Result<OcrResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ImageSource::Bytes(bytes) = image else {
            anyhow::bail!("fake engine only reads bytes");
        };
        let text = String::from_utf8(bytes.clone())?;
        match text.as_str() {
            "fail" => anyhow::bail!("recognition engine crashed"),
            "boom" => anyhow::bail!("model file not found"),
            _ => Ok(OcrResult {
                language: (!text.is_empty()).then(|| "ja".to_string()),
                confidence: 0.9,
                text_blocks: Vec::new(),
                text,
            }),
        }
    }
}

#[derive(Default)]
struct FakeTranslator {
    calls: AtomicUsize,
    sources: Mutex<Vec<String>>,
}

impl Engine for FakeTranslator {
    fn name(&self) -> &str {
        "fake-translate"
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }
}

#[async_trait]
impl TranslationEngine for FakeTranslator {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
        _options: &TranslateOptions,
    ) -> anyhow::Result<TranslationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().unwrap().push(source.to_string());
        Ok(TranslationResult {
            translated_text: format!("[{target}] {text}"),
            confidence: 0.8,
            provider: "fake".into(),
            source_language: source.to_string(),
        })
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<PipelineEvent>>,
}

impl PipelineObserver for Recorder {
    fn on_event(&self, event: &PipelineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

struct Harness {
    pipeline: OcrTranslationPipeline,
    ocr: Arc<FakeOcr>,
    translator: Arc<FakeTranslator>,
    recorder: Arc<Recorder>,
}

fn harness() -> Harness {
    let pipeline = OcrTranslationPipeline::new(OcrPipelineConfig::default());
    let ocr = Arc::new(FakeOcr::default());
    let translator = Arc::new(FakeTranslator::default());
    let recorder = Arc::new(Recorder::default());
    pipeline.register_ocr_engine(ocr.clone());
    pipeline.register_translation_engine(translator.clone());
    pipeline.add_observer(recorder.clone());
    Harness {
        pipeline,
        ocr,
        translator,
        recorder,
    }
}

fn image(text: &str) -> ImageSource {
    ImageSource::Bytes(text.as_bytes().to_vec())
}

#[tokio::test]
async fn batch_isolates_a_failing_image() {
    let h = harness();
    let images: Vec<ImageSource> = ["one", "two", "fail", "four", "five"]
        .into_iter()
        .map(image)
        .collect();

    let outcome = h
        .pipeline
        .process_batch(
            &images,
            BatchOptions::default().with_batch_id(BatchId::new("b1").unwrap()),
        )
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.results.len(), 5);
    assert_eq!(outcome.errors.len(), 5);
    assert_eq!(outcome.succeeded(), 4);
    assert!(outcome.results[2].is_none());
    let err = outcome.errors[2].as_ref().unwrap();
    assert_eq!(err.kind, ErrorKind::Processing);
    for index in [0, 1, 3, 4] {
        let item = outcome.results[index].as_ref().unwrap();
        assert_eq!(item.job_id.as_str(), format!("b1_image_{index}"));
        assert!(outcome.errors[index].is_none());
    }
    assert_eq!(
        outcome.results[4]
            .as_ref()
            .unwrap()
            .translation_result
            .as_ref()
            .unwrap()
            .translated_text,
        "[en] five"
    );

    let progress: Vec<(usize, usize)> = h
        .recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::BatchProgress(p) => Some((p.processed, p.errors)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(3, 1), (5, 1)]);
}

#[tokio::test]
async fn batch_concurrency_controls_chunking() {
    let h = harness();
    let images: Vec<ImageSource> = ["a", "b", "c", "d"].into_iter().map(image).collect();

    let outcome = h
        .pipeline
        .process_batch(&images, BatchOptions::default().with_concurrency(1))
        .await;

    assert!(outcome.success);
    let chunks = h
        .recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, PipelineEvent::BatchProgress(_)))
        .count();
    assert_eq!(chunks, 4);
}

#[tokio::test]
async fn no_text_short_circuits_through_the_job_pipeline() {
    let h = harness();
    let manager = PipelineManager::new(
        PipelineConfig::default().with_poll_interval(Duration::from_millis(10)),
    );
    h.pipeline.register_processors(&manager);

    let outcome = manager
        .process(
            OCR_TRANSLATE_JOB,
            json!({ "image": { "bytes": [] } }),
            ProcessOptions::default().with_max_wait(Duration::from_secs(5)),
        )
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let outcome: OcrTranslationOutcome = serde_json::from_value(outcome).unwrap();

    assert_eq!(outcome.ocr_result.text, "");
    assert!(outcome.translation_result.is_none());
    assert_eq!(outcome.stage, Stage::Ocr);
    assert_eq!(h.translator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn translate_job_uses_requested_languages() {
    let h = harness();
    let manager = PipelineManager::new(
        PipelineConfig::default().with_poll_interval(Duration::from_millis(10)),
    );
    h.pipeline.register_processors(&manager);

    let result = manager
        .process(
            TRANSLATE_JOB,
            json!({ "text": "こんにちは", "source_language": "ja", "target_language": "de" }),
            ProcessOptions::default().with_max_wait(Duration::from_secs(5)),
        )
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let result: TranslationResult = serde_json::from_value(result).unwrap();

    assert_eq!(result.translated_text, "[de] こんにちは");
    assert_eq!(result.source_language, "ja");
}

#[tokio::test]
async fn engine_failures_follow_the_processing_backoff_cap() {
    let manager = PipelineManager::new(
        PipelineConfig::default().with_poll_interval(Duration::from_millis(10)),
    );
    manager.error_handler().register_strategy(
        ErrorKind::Processing,
        policy_strategy(RetryPolicy::exponential(
            3,
            Duration::from_millis(20),
            Duration::from_secs(1),
        )),
    );
    let pipeline = OcrTranslationPipeline::for_manager(OcrPipelineConfig::default(), &manager);
    let ocr = Arc::new(FakeOcr::default());
    pipeline.register_ocr_engine(ocr.clone());
    pipeline.register_translation_engine(Arc::new(FakeTranslator::default()));
    pipeline.register_processors(&manager);

    let started = Instant::now();
    let err = manager
        .process(
            OCR_TRANSLATE_JOB,
            json!({ "image": { "bytes": b"fail".to_vec() } }),
            ProcessOptions::default()
                .with_max_wait(Duration::from_secs(5))
                .with_max_retries(5),
        )
        .await
        .unwrap_err();

    // one attempt plus three retries at 20, 40 and 80 ms
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= Duration::from_millis(140));
    assert_eq!(err.kind, ErrorKind::Processing);
    assert!(!err.retryable);
    assert_eq!(err.retry_delay, Duration::ZERO);
}

#[tokio::test]
async fn malformed_job_payload_is_a_validation_error() {
    let h = harness();
    let manager = PipelineManager::new(
        PipelineConfig::default().with_poll_interval(Duration::from_millis(10)),
    );
    h.pipeline.register_processors(&manager);

    let err = manager
        .process(
            OCR_TRANSLATE_JOB,
            json!({ "picture": "page.png" }),
            ProcessOptions::default().with_max_wait(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Validation);
    assert!(err.message.contains("ocr_translate"));
}

#[tokio::test]
async fn translation_uses_the_detected_language() {
    let h = harness();

    let outcome = h
        .pipeline
        .process(&image("ありがとう"), ProcessImageOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.stage, Stage::Translation);
    assert_eq!(*h.translator.sources.lock().unwrap(), vec!["ja".to_string()]);
    assert!(outcome.message.is_none());
}

#[tokio::test]
async fn results_are_cached_unless_skipped() {
    let h = harness();
    let page = image("cached page");

    h.pipeline.process(&page, ProcessImageOptions::default()).await.unwrap();
    h.pipeline.process(&page, ProcessImageOptions::default()).await.unwrap();
    assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.translator.calls.load(Ordering::SeqCst), 1);

    h.pipeline
        .process(&page, ProcessImageOptions::default().skip_cache())
        .await
        .unwrap();
    assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.translator.calls.load(Ordering::SeqCst), 2);

    let cached_flags: Vec<bool> = h
        .recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::OcrCompleted { cached, .. } => Some(*cached),
            _ => None,
        })
        .collect();
    assert_eq!(cached_flags, vec![false, true, false]);
}

#[tokio::test]
async fn engine_failures_are_classified_and_reported() {
    let h = harness();
    let id = JobId::new("page-9").unwrap();

    let err = h
        .pipeline
        .process(&image("boom"), ProcessImageOptions::default().with_job_id(id.clone()))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Resource);
    let events = h.recorder.events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        PipelineEvent::ProcessFailed { job_id, error } if *job_id == id && error.kind == ErrorKind::Resource
    )));
}

#[tokio::test]
async fn engine_selection_errors() {
    let h = harness();
    let err = h
        .pipeline
        .process(
            &image("text"),
            ProcessImageOptions::default().with_engines("tesseract", AUTO),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);

    let empty = OcrTranslationPipeline::new(OcrPipelineConfig::default());
    let err = empty
        .process(&image("text"), ProcessImageOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Resource);

    let err = h
        .pipeline
        .process(
            &image("text"),
            ProcessImageOptions::default().with_languages("ko", "en"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Resource);
}

#[tokio::test]
async fn cancelled_token_stops_before_recognition() {
    let h = harness();
    let token = CancellationToken::new();
    token.cancel();

    let err = h
        .pipeline
        .process_with_token(&image("text"), ProcessImageOptions::default(), &token)
        .await
        .unwrap_err();

    assert!(err.message.contains("cancelled"));
    assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 0);
}
