//! Contracts for the external OCR and translation engines.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl ImageSource {
    /// SHA-256 hex of the image bytes, or of the path for on-disk images.
    pub fn fingerprint(&self) -> String {
        match self {
            ImageSource::Path(path) => {
                sha256_hex(format!("path:{}", path.display()).as_bytes())
            }
            ImageSource::Bytes(bytes) => sha256_hex(bytes),
        }
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Bytes(bytes)
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Path(path) => write!(f, "{}", path.display()),
            ImageSource::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// What an engine can do; used for `auto` selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// Runs without network access.
    pub offline: bool,
    pub high_quality: bool,
    /// Supported language codes. Empty means any.
    pub languages: Vec<String>,
}

impl EngineCapabilities {
    pub fn supports(&self, language: &str) -> bool {
        language == "auto"
            || self.languages.is_empty()
            || self.languages.iter().any(|l| l.eq_ignore_ascii_case(language))
    }
}

/// Identity shared by every engine kind.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> EngineCapabilities;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub confidence: f32,
    /// `[x, y, width, height]` in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[u32; 4]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    /// Empty when no text was found.
    pub text: String,
    pub confidence: f32,
    /// Detected language, when the engine reports one.
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub text_blocks: Vec<TextBlock>,
}

impl OcrResult {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            language: None,
            text_blocks: Vec::new(),
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizeOptions {
    pub language: String,
}

#[async_trait]
pub trait OcrEngine: Engine {
    /// Recognize text in `image`. "No text" is an empty result, not an error.
    async fn recognize(
        &self,
        image: &ImageSource,
        options: &RecognizeOptions,
    ) -> anyhow::Result<OcrResult>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub translated_text: String,
    pub confidence: f32,
    pub provider: String,
    pub source_language: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateOptions {
    pub high_quality: bool,
}

#[async_trait]
pub trait TranslationEngine: Engine {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
        options: &TranslateOptions,
    ) -> anyhow::Result<TranslationResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_depends_on_content() {
        let a = ImageSource::Bytes(vec![1, 2, 3]);
        let b = ImageSource::Bytes(vec![1, 2, 4]);
        assert_eq!(a.fingerprint(), ImageSource::Bytes(vec![1, 2, 3]).fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn path_and_bytes_do_not_collide() {
        let path = ImageSource::Path(PathBuf::from("page.png"));
        let bytes = ImageSource::Bytes(b"page.png".to_vec());
        assert_ne!(path.fingerprint(), bytes.fingerprint());
    }

    #[test]
    fn empty_language_list_supports_everything() {
        let any = EngineCapabilities::default();
        assert!(any.supports("ja"));

        let limited = EngineCapabilities {
            languages: vec!["en".into(), "JA".into()],
            ..EngineCapabilities::default()
        };
        assert!(limited.supports("ja"));
        assert!(limited.supports("auto"));
        assert!(!limited.supports("ko"));
    }

    #[test]
    fn whitespace_is_not_text() {
        let mut result = OcrResult::empty();
        assert!(!result.has_text());
        result.text = " \n\t".into();
        assert!(!result.has_text());
        result.text = "こんにちは".into();
        assert!(result.has_text());
    }
}
