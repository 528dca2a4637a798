//! OCR backends: turn a page image into text plus a confidence score.
//!
//! [`VisionOcr`] asks a vision LLM to transcribe the page and to end its
//! answer with a `CONFIDENCE: NN` line. When a model ignores that
//! instruction the confidence is estimated from the share of readable
//! characters in the transcription instead.
//!
//! ## Retry strategy
//!
//! HTTP 429 / 503 from LLM APIs are frequent under concurrent load. Each
//! call retries with exponential backoff (`ocr_retry_backoff_ms * 2^n`);
//! with 500 ms and 3 retries the waits are 500 ms, 1 s, 2 s.

use crate::config::{retry_delay, ExtractionConfig};
use crate::error::PipelineError;
use crate::extract::cleanup::clean_text;
use crate::prompts::{ocr_language_hint, OCR_SYSTEM_PROMPT};
use crate::validation::readable_ratio;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Transcription of a single page.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrPage {
    pub text: String,
    /// 0–100.
    pub confidence: f32,
}

/// Anything that can read text off an image.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Identifier recorded in the Document's OCR metadata.
    fn engine(&self) -> &str;

    /// Transcribe one page. `page` is 1-based and only used for logging.
    async fn recognize(&self, page: usize, image: ImageData) -> Result<OcrPage, PipelineError>;
}

// ── Vision LLM backend ───────────────────────────────────────────────────

/// OCR through a vision-capable chat model.
pub struct VisionOcr {
    provider: Arc<dyn LLMProvider>,
    engine: String,
    language: String,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl VisionOcr {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        let engine = format!(
            "vlm:{}/{}",
            config.ocr_provider.as_deref().unwrap_or("auto"),
            config.ocr_model.as_deref().unwrap_or("default")
        );
        Self {
            provider,
            engine,
            language: config.ocr_language.clone(),
            temperature: config.ocr_temperature,
            max_tokens: config.ocr_max_tokens,
            max_retries: config.ocr_max_retries,
            retry_backoff_ms: config.ocr_retry_backoff_ms,
        }
    }

    /// Build the backend from the configured (or auto-detected) provider.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, PipelineError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl OcrBackend for VisionOcr {
    fn engine(&self) -> &str {
        &self.engine
    }

    async fn recognize(&self, page: usize, image: ImageData) -> Result<OcrPage, PipelineError> {
        let start = Instant::now();
        let messages = vec![
            ChatMessage::system(OCR_SYSTEM_PROMPT),
            ChatMessage::system(ocr_language_hint(&self.language)),
            ChatMessage::user_with_images("", vec![image]),
        ];
        let options = self.options();

        let mut last_err: Option<String> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = retry_delay(self.retry_backoff_ms, attempt);
                warn!(
                    "OCR page {}: retry {}/{} after {}ms",
                    page,
                    attempt,
                    self.max_retries,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "OCR page {}: {} input tokens, {} output tokens, {:?}",
                        page,
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(parse_transcription(&response.content));
                }
                Err(e) => {
                    warn!("OCR page {}: attempt {} failed: {}", page, attempt + 1, e);
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(PipelineError::ExtractionFailed {
            reason: format!(
                "OCR of page {} failed after {} retries: {}",
                page,
                self.max_retries,
                last_err.unwrap_or_else(|| "unknown error".to_string())
            ),
        })
    }
}

static RE_CONFIDENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t]*\**confidence\**[ \t]*[:=][ \t]*\**[ \t]*(\d{1,3}(?:\.\d+)?)[ \t]*%?[ \t]*$")
        .expect("confidence regex is valid")
});

/// Split a VLM answer into transcription and confidence.
///
/// The last `CONFIDENCE:` line wins and is removed from the text. Without
/// one, confidence is the readable-character share of the text scaled to
/// 0–100 (and 0 for an empty answer).
pub fn parse_transcription(raw: &str) -> OcrPage {
    let last = RE_CONFIDENCE.captures_iter(raw).last();
    let (text, reported) = match last {
        Some(caps) => {
            let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
            let value = caps[1].parse::<f32>().ok();
            let mut text = String::with_capacity(raw.len());
            text.push_str(&raw[..whole.start]);
            text.push_str(&raw[whole.end..]);
            (text, value)
        }
        None => (raw.to_string(), None),
    };

    let text = clean_text(&text);
    let confidence = match reported {
        Some(c) => c.clamp(0.0, 100.0),
        None if text.trim().is_empty() => 0.0,
        None => readable_ratio(&text) * 100.0,
    };
    OcrPage { text, confidence }
}

// ── Provider resolution ──────────────────────────────────────────────────

const DEFAULT_OCR_MODEL: &str = "gpt-4.1-nano";

fn create_vision_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        PipelineError::InvalidConfig(format!("OCR provider '{name}' is not configured: {e}"))
    })
}

/// Resolve the OCR provider, from most to least specific:
///
/// 1. `ocr_provider` (+ `ocr_model`) from the config
/// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set
/// 3. OpenAI when `OPENAI_API_KEY` is set
/// 4. `ProviderFactory::from_env` auto-detection
pub fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref name) = config.ocr_provider {
        let model = config.ocr_model.as_deref().unwrap_or(DEFAULT_OCR_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        let model = config.ocr_model.as_deref().unwrap_or(DEFAULT_OCR_MODEL);
        return create_vision_provider("openai", model);
    }

    let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| {
        PipelineError::InvalidConfig(format!(
            "no OCR provider could be auto-detected (set OPENAI_API_KEY, ANTHROPIC_API_KEY, \
             or --ocr-provider): {e}"
        ))
    })?;
    Ok(llm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_line_is_parsed_and_removed() {
        let page = parse_transcription("INVOICE 2024-17\nTotal due: 120 EUR\nCONFIDENCE: 72");
        assert_eq!(page.confidence, 72.0);
        assert_eq!(page.text, "INVOICE 2024-17\nTotal due: 120 EUR");
    }

    #[test]
    fn confidence_variants() {
        assert_eq!(parse_transcription("a\n**Confidence:** 88%").confidence, 88.0);
        assert_eq!(parse_transcription("a\nconfidence = 40.5").confidence, 40.5);
        assert_eq!(parse_transcription("a\nCONFIDENCE: 250").confidence, 100.0);
    }

    #[test]
    fn last_confidence_line_wins() {
        let page = parse_transcription("CONFIDENCE: 10\nbody text\nCONFIDENCE: 90");
        assert_eq!(page.confidence, 90.0);
        assert!(page.text.contains("CONFIDENCE: 10"));
    }

    #[test]
    fn missing_confidence_is_estimated() {
        let page = parse_transcription("Plain readable words on a page");
        assert!(page.confidence > 90.0);

        let garbled = parse_transcription("\u{FFFD}\u{FFFD}\u{FFFD}ab");
        assert!(garbled.confidence < 50.0);
    }

    #[test]
    fn empty_answer_has_zero_confidence() {
        let page = parse_transcription("");
        assert_eq!(page.confidence, 0.0);
        assert!(page.text.is_empty());
    }

    #[test]
    fn fenced_answer_is_cleaned() {
        let page = parse_transcription("```\nHello world\n```\nCONFIDENCE: 95");
        assert_eq!(page.text, "Hello world");
    }
}
