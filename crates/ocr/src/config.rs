use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::AUTO;

/// Defaults for single-image and batch runs; per-call options override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrPipelineConfig {
    /// Images processed at once within a batch (at least 1).
    pub concurrency: usize,
    pub source_language: String,
    pub target_language: String,
    pub ocr_engine: String,
    pub translation_engine: String,
    pub high_quality: bool,
    pub ocr_cache_ttl: Duration,
    pub translation_cache_ttl: Duration,
}

impl Default for OcrPipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            source_language: AUTO.to_string(),
            target_language: "en".to_string(),
            ocr_engine: AUTO.to_string(),
            translation_engine: AUTO.to_string(),
            high_quality: false,
            ocr_cache_ttl: Duration::from_secs(24 * 60 * 60),
            translation_cache_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl OcrPipelineConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_languages(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source_language = source.into();
        self.target_language = target.into();
        self
    }

    pub fn with_engines(mut self, ocr: impl Into<String>, translation: impl Into<String>) -> Self {
        self.ocr_engine = ocr.into();
        self.translation_engine = translation.into();
        self
    }

    pub fn with_high_quality(mut self, high_quality: bool) -> Self {
        self.high_quality = high_quality;
        self
    }
}
