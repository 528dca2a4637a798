//! Configuration types for the intake pipeline.
//!
//! Pipeline behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Extraction-engine knobs live in
//! [`ExtractionConfig`] and worker (outer retry) knobs in [`WorkerConfig`].
//! Every threshold the pipeline applies is a field here rather than a
//! literal in the code that applies it.

use crate::error::PipelineError;
use crate::prompts::VISION_PLACEHOLDER;
use crate::validation::ValidationPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a pipeline run.
///
/// # Example
/// ```rust
/// use edgequake_intake::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .enqueue_max_attempts(5)
///     .min_chars(40)
///     .build()
///     .unwrap();
/// assert_eq!(config.enqueue_max_attempts, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Thresholds deciding whether extracted text is usable.
    pub validation: ValidationPolicy,

    /// Enqueue attempts per handoff, including the first. Default: 3.
    ///
    /// Scoped to the enqueue call only; extraction is never redone by
    /// this retry.
    pub enqueue_max_attempts: u32,

    /// Initial enqueue retry delay in milliseconds, doubling per attempt. Default: 500.
    pub enqueue_backoff_ms: u64,

    /// Object storage download timeout in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Extraction engine timeout in seconds. Default: 300.
    ///
    /// OCR of a long scanned document makes one VLM call per page, so this
    /// is much larger than the per-call OCR timeout.
    pub extraction_timeout_secs: u64,

    /// Instruction sent as `extractedText` when vision fallback leaves no text.
    pub vision_placeholder: String,

    /// Name of the downstream analysis queue. Default: "document-analysis".
    pub analysis_queue: String,

    /// Extraction engine settings.
    pub extraction: ExtractionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            validation: ValidationPolicy::default(),
            enqueue_max_attempts: 3,
            enqueue_backoff_ms: 500,
            download_timeout_secs: 120,
            extraction_timeout_secs: 300,
            vision_placeholder: VISION_PLACEHOLDER.to_string(),
            analysis_queue: "document-analysis".to_string(),
            extraction: ExtractionConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn validation(mut self, policy: ValidationPolicy) -> Self {
        self.config.validation = policy;
        self
    }

    pub fn min_chars(mut self, n: usize) -> Self {
        self.config.validation.min_chars = n;
        self
    }

    pub fn min_words(mut self, n: usize) -> Self {
        self.config.validation.min_words = n;
        self
    }

    pub fn max_garbage_ratio(mut self, ratio: f32) -> Self {
        self.config.validation.max_garbage_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn enqueue_max_attempts(mut self, n: u32) -> Self {
        self.config.enqueue_max_attempts = n.max(1);
        self
    }

    pub fn enqueue_backoff_ms(mut self, ms: u64) -> Self {
        self.config.enqueue_backoff_ms = ms;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    pub fn extraction_timeout_secs(mut self, secs: u64) -> Self {
        self.config.extraction_timeout_secs = secs.max(1);
        self
    }

    pub fn vision_placeholder(mut self, text: impl Into<String>) -> Self {
        self.config.vision_placeholder = text.into();
        self
    }

    pub fn analysis_queue(mut self, name: impl Into<String>) -> Self {
        self.config.analysis_queue = name.into();
        self
    }

    pub fn extraction(mut self, extraction: ExtractionConfig) -> Self {
        self.config.extraction = extraction;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        c.validation.check()?;
        if c.vision_placeholder.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "vision placeholder must not be empty".into(),
            ));
        }
        if c.analysis_queue.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "analysis queue name must not be empty".into(),
            ));
        }
        c.extraction.check()?;
        Ok(self.config)
    }
}

/// Knobs for the standard extraction engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Native text shorter than this (non-whitespace chars) triggers OCR. Default: 50.
    ///
    /// Scanned PDFs often carry a stray text layer (a page number, a scanner
    /// watermark); a handful of characters must not count as "native text".
    pub native_min_chars: usize,

    /// OCR confidence (0–100) below which the engine falls back to vision. Default: 60.
    pub ocr_min_confidence: f32,

    /// Language hint recorded in OCR metadata and passed to the OCR prompt. Default: "eng".
    pub ocr_language: String,

    /// Maximum PDF pages rasterised for OCR. Default: 20.
    pub max_ocr_pages: usize,

    /// Maximum rendered image dimension in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Directory holding the pdfium shared library. If None, the system library is used.
    pub pdfium_lib_path: Option<PathBuf>,

    /// LLM provider name for OCR (e.g. "openai"). If None, auto-detected from the environment.
    pub ocr_provider: Option<String>,

    /// Vision model for OCR. If None, the provider default.
    pub ocr_model: Option<String>,

    /// Sampling temperature for OCR calls. Default: 0.1.
    pub ocr_temperature: f32,

    /// Maximum tokens per OCR call. Default: 4096.
    pub ocr_max_tokens: usize,

    /// Retries per OCR call on a transient failure. Default: 3.
    pub ocr_max_retries: u32,

    /// Initial OCR retry delay in milliseconds (exponential backoff). Default: 500.
    pub ocr_retry_backoff_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            native_min_chars: 50,
            ocr_min_confidence: 60.0,
            ocr_language: "eng".to_string(),
            max_ocr_pages: 20,
            max_rendered_pixels: 2000,
            pdfium_lib_path: None,
            ocr_provider: None,
            ocr_model: None,
            ocr_temperature: 0.1,
            ocr_max_tokens: 4096,
            ocr_max_retries: 3,
            ocr_retry_backoff_ms: 500,
        }
    }
}

impl ExtractionConfig {
    fn check(&self) -> Result<(), PipelineError> {
        if !(0.0..=100.0).contains(&self.ocr_min_confidence) {
            return Err(PipelineError::InvalidConfig(format!(
                "OCR minimum confidence must be 0–100, got {}",
                self.ocr_min_confidence
            )));
        }
        if self.max_ocr_pages == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_ocr_pages must be ≥ 1".into(),
            ));
        }
        if self.max_rendered_pixels < 100 {
            return Err(PipelineError::InvalidConfig(format!(
                "max_rendered_pixels must be ≥ 100, got {}",
                self.max_rendered_pixels
            )));
        }
        Ok(())
    }
}

/// Settings for the worker pool that plays the outer queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs processed concurrently. Default: 4.
    pub concurrency: usize,

    /// Pipeline runs per message, including the first. Default: 3.
    ///
    /// Only retryable failures are re-run; not-found and validation
    /// failures are dead-lettered after one run.
    pub max_attempts: u32,

    /// Initial delay before re-running a message, doubling per attempt. Default: 1000.
    pub retry_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            retry_backoff_ms: 1000,
        }
    }
}

impl WorkerConfig {
    /// Delay before attempt `attempt` (1-based; the first attempt has none).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        retry_delay(self.retry_backoff_ms, attempt - 1)
    }
}

/// Exponential delay before retry number `retry` (1-based): `base_ms * 2^(retry-1)`.
///
/// Saturates instead of overflowing for large retry counts.
pub(crate) fn retry_delay(base_ms: u64, retry: u32) -> Duration {
    let factor = 2u64.saturating_pow(retry.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor))
}
