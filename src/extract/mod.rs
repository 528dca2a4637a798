//! Extraction engine: bytes + MIME type in, [`ExtractionResult`] out.
//!
//! [`StandardEngine`] routes by MIME type:
//!
//! ```text
//!  text/*, JSON, XML ──► decode UTF-8 ─────────────────────────► native
//!  application/pdf ───► pdfium text layer ──(thin?)──► rasterise ─┐
//!  image/png, jpeg ───► decode + downscale ───────────────────────┤
//!                                                                 ▼
//!                                      OcrBackend per page ──► ocr
//!                                          │ confidence < min, or no backend
//!                                          ▼
//!                                       vision fallback
//! ```
//!
//! Anything else is [`PipelineError::UnsupportedMimeType`].

pub mod cleanup;
pub mod encode;
pub mod ocr;
pub mod pdf;

use crate::config::ExtractionConfig;
use crate::error::PipelineError;
use crate::model::ExtractionResult;
use async_trait::async_trait;
use cleanup::clean_text;
use image::DynamicImage;
use ocr::OcrBackend;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Produces text from a downloaded file.
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    /// Identifier recorded as the OCR engine in Document metadata.
    fn name(&self) -> &str;

    async fn extract_text(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<ExtractionResult, PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MimeKind {
    Text,
    Pdf,
    Image,
}

fn classify(mime_type: &str) -> Option<MimeKind> {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "application/pdf" => Some(MimeKind::Pdf),
        "image/png" | "image/jpeg" | "image/jpg" => Some(MimeKind::Image),
        "application/json" | "application/xml" => Some(MimeKind::Text),
        m if m.starts_with("text/") => Some(MimeKind::Text),
        _ => None,
    }
}

fn visible_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

/// The default engine: native text, pdfium, and an optional OCR backend.
pub struct StandardEngine {
    config: ExtractionConfig,
    ocr: Option<Arc<dyn OcrBackend>>,
    name: String,
}

impl StandardEngine {
    /// An engine without OCR; scanned input goes straight to vision fallback.
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            config,
            ocr: None,
            name: "standard".to_string(),
        }
    }

    pub fn with_ocr(mut self, backend: Arc<dyn OcrBackend>) -> Self {
        self.name = format!("standard+{}", backend.engine());
        self.ocr = Some(backend);
        self
    }

    pub fn has_ocr(&self) -> bool {
        self.ocr.is_some()
    }

    fn native_text(&self, bytes: &[u8]) -> ExtractionResult {
        let text = clean_text(&String::from_utf8_lossy(bytes));
        ExtractionResult::native(text)
    }

    async fn extract_pdf(&self, bytes: &[u8]) -> Result<ExtractionResult, PipelineError> {
        let bytes = Arc::new(bytes.to_vec());
        let lib_dir = self.config.pdfium_lib_path.clone();

        let layer = pdf::extract_text(Arc::clone(&bytes), lib_dir.clone()).await?;
        let text = clean_text(&layer.joined());
        let chars = visible_chars(&text);
        if chars >= self.config.native_min_chars {
            info!(pages = layer.page_count, chars, "PDF has a native text layer");
            return Ok(ExtractionResult::native(text));
        }

        let thin = format!(
            "native text layer too thin ({} characters, minimum {})",
            chars, self.config.native_min_chars
        );
        info!(pages = layer.page_count, chars, "PDF needs OCR");

        let Some(ref backend) = self.ocr else {
            return Ok(no_ocr_fallback(text).with_warning(thin));
        };

        let pages = pdf::render_pages(
            bytes,
            lib_dir,
            self.config.max_rendered_pixels,
            self.config.max_ocr_pages,
        )
        .await?;

        let mut result = self.recognize_pages(backend.as_ref(), pages).await?;
        result.warnings.insert(0, thin);
        if layer.page_count > self.config.max_ocr_pages {
            result = result.with_warning(format!(
                "OCR limited to the first {} of {} pages",
                self.config.max_ocr_pages, layer.page_count
            ));
        }
        Ok(result)
    }

    async fn extract_image(&self, bytes: &[u8]) -> Result<ExtractionResult, PipelineError> {
        let Some(ref backend) = self.ocr else {
            return Ok(no_ocr_fallback(String::new()));
        };

        let owned = bytes.to_vec();
        let max_pixels = self.config.max_rendered_pixels;
        let image = tokio::task::spawn_blocking(move || {
            encode::decode_image(&owned).map(|img| encode::fit_within(img, max_pixels))
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Image decode task panicked: {e}")))??;

        self.recognize_pages(backend.as_ref(), vec![(0, image)]).await
    }

    /// OCR each page in order and merge the transcriptions.
    ///
    /// Overall confidence is the page confidences weighted by each page's
    /// visible character count, so a blank separator page does not drag a
    /// well-read document below the fallback threshold.
    async fn recognize_pages(
        &self,
        backend: &dyn OcrBackend,
        pages: Vec<(usize, DynamicImage)>,
    ) -> Result<ExtractionResult, PipelineError> {
        let mut texts = Vec::with_capacity(pages.len());
        let mut weighted = 0.0f64;
        let mut weight = 0usize;
        let mut warnings = Vec::new();

        for (idx, image) in pages {
            let data = encode::encode_page(&image)?;
            let page = backend.recognize(idx + 1, data).await?;
            let chars = visible_chars(&page.text);
            debug!(page = idx + 1, chars, confidence = page.confidence, "OCR page done");
            if chars == 0 {
                warnings.push(format!("page {} produced no text", idx + 1));
                continue;
            }
            weighted += f64::from(page.confidence) * chars as f64;
            weight += chars;
            texts.push(page.text);
        }

        let confidence = if weight == 0 {
            0.0
        } else {
            (weighted / weight as f64) as f32
        };
        let mut result = ExtractionResult::ocr(clean_text(&texts.join("\n\n")), confidence);
        result.warnings = warnings;

        if confidence < self.config.ocr_min_confidence {
            warn!(
                confidence,
                minimum = self.config.ocr_min_confidence,
                "OCR confidence too low, falling back to vision"
            );
            result = result
                .with_warning(format!(
                    "OCR confidence {:.0} below minimum {:.0}",
                    confidence, self.config.ocr_min_confidence
                ))
                .with_vision_fallback();
        }
        Ok(result)
    }
}

/// Vision fallback when no OCR backend is available: text is whatever
/// native text existed, and no confidence was measured.
fn no_ocr_fallback(text: String) -> ExtractionResult {
    let mut result = ExtractionResult::native(text)
        .with_warning("no OCR backend configured")
        .with_vision_fallback();
    result.ocr_required = true;
    result
}

#[async_trait]
impl ExtractionEngine for StandardEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract_text(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<ExtractionResult, PipelineError> {
        let start = Instant::now();
        let kind = classify(mime_type).ok_or_else(|| PipelineError::UnsupportedMimeType {
            mime_type: mime_type.to_string(),
        })?;

        let result = match kind {
            MimeKind::Text => self.native_text(bytes),
            MimeKind::Pdf => self.extract_pdf(bytes).await?,
            MimeKind::Image => self.extract_image(bytes).await?,
        };
        let elapsed = start.elapsed().as_millis() as u64;
        info!(
            method = result.method.as_str(),
            ocr_required = result.ocr_required,
            fallback_to_vision = result.fallback_to_vision,
            elapsed_ms = elapsed,
            "Extraction finished"
        );
        Ok(result.with_processing_time(elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExtractionMethod;
    use edgequake_llm::ImageData;
    use image::{Rgba, RgbaImage};
    use ocr::OcrPage;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedOcr {
        text: &'static str,
        confidence: f32,
        calls: AtomicUsize,
    }

    impl FixedOcr {
        fn new(text: &'static str, confidence: f32) -> Arc<Self> {
            Arc::new(Self {
                text,
                confidence,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OcrBackend for FixedOcr {
        fn engine(&self) -> &str {
            "fixed"
        }

        async fn recognize(&self, _page: usize, image: ImageData) -> Result<OcrPage, PipelineError> {
            assert_eq!(image.mime_type, "image/png");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(OcrPage {
                text: self.text.to_string(),
                confidence: self.confidence,
            })
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(32, 16, Rgba([0, 0, 0, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn classify_mime_types() {
        assert_eq!(classify("text/plain; charset=utf-8"), Some(MimeKind::Text));
        assert_eq!(classify("Application/PDF"), Some(MimeKind::Pdf));
        assert_eq!(classify("image/jpeg"), Some(MimeKind::Image));
        assert_eq!(classify("application/json"), Some(MimeKind::Text));
        assert_eq!(classify("application/zip"), None);
    }

    #[tokio::test]
    async fn plain_text_is_native() {
        let engine = StandardEngine::new(ExtractionConfig::default());
        let result = engine
            .extract_text(b"Quarterly report\r\nRevenue grew   \r\n", "text/plain")
            .await
            .unwrap();
        assert_eq!(result.method, ExtractionMethod::Native);
        assert!(!result.ocr_required);
        assert_eq!(result.text, "Quarterly report\nRevenue grew");
    }

    #[tokio::test]
    async fn image_goes_through_ocr() {
        let ocr = FixedOcr::new("Receipt total 42.00 EUR", 72.0);
        let engine = StandardEngine::new(ExtractionConfig::default()).with_ocr(ocr.clone());
        assert_eq!(engine.name(), "standard+fixed");

        let result = engine.extract_text(&png_bytes(), "image/png").await.unwrap();
        assert!(result.ocr_required);
        assert!(!result.fallback_to_vision);
        assert_eq!(result.method, ExtractionMethod::Ocr);
        assert_eq!(result.ocr_confidence, Some(72.0));
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn low_confidence_falls_back_to_vision() {
        let engine = StandardEngine::new(ExtractionConfig::default())
            .with_ocr(FixedOcr::new("r3c31pt t0t4l", 25.0));
        let result = engine.extract_text(&png_bytes(), "image/png").await.unwrap();
        assert!(result.fallback_to_vision);
        assert_eq!(result.method, ExtractionMethod::Vision);
        assert_eq!(result.ocr_confidence, Some(25.0));
        assert!(result.warnings.iter().any(|w| w.contains("below minimum")));
    }

    #[tokio::test]
    async fn image_without_backend_falls_back_to_vision() {
        let engine = StandardEngine::new(ExtractionConfig::default());
        let result = engine.extract_text(&png_bytes(), "image/png").await.unwrap();
        assert!(result.ocr_required);
        assert!(result.fallback_to_vision);
        assert!(result.text.is_empty());
        assert_eq!(result.ocr_confidence, None);
    }

    #[tokio::test]
    async fn blank_pages_do_not_count_toward_confidence() {
        let engine = StandardEngine::new(ExtractionConfig::default())
            .with_ocr(FixedOcr::new("", 0.0));
        let result = engine.extract_text(&png_bytes(), "image/png").await.unwrap();
        assert_eq!(result.ocr_confidence, Some(0.0));
        assert!(result.fallback_to_vision);
        assert!(result.warnings.iter().any(|w| w.contains("no text")));
    }

    #[tokio::test]
    async fn unsupported_mime_is_rejected() {
        let engine = StandardEngine::new(ExtractionConfig::default());
        let err = engine
            .extract_text(b"PK\x03\x04", "application/zip")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedMimeType { .. }));
    }

    #[tokio::test]
    async fn corrupt_image_is_unreadable() {
        let engine =
            StandardEngine::new(ExtractionConfig::default()).with_ocr(FixedOcr::new("x", 99.0));
        let err = engine
            .extract_text(b"not a png", "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnreadableDocument { .. }));
    }
}
