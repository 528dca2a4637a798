//! PDF access through pdfium: native text layer and page rasterisation.
//!
//! pdfium keeps thread-local state and is CPU-bound, so every call here
//! runs inside `tokio::task::spawn_blocking`. The bytes are moved into the
//! blocking task; nothing touches the filesystem.
//!
//! Rendering caps the longest edge at `max_rendered_pixels` rather than
//! picking a DPI: page sizes vary too much for a fixed DPI to bound memory.

use crate::error::PipelineError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Native text of a PDF, per page.
#[derive(Debug, Clone, Default)]
pub struct PdfText {
    pub page_count: usize,
    pub pages: Vec<String>,
}

impl PdfText {
    /// All pages joined with a blank line.
    pub fn joined(&self) -> String {
        self.pages.join("\n\n")
    }
}

fn bind(lib_dir: Option<&Path>) -> Result<Pdfium, PipelineError> {
    let bindings = match lib_dir {
        Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| PipelineError::ExtractionFailed {
        reason: format!("cannot load pdfium library: {e:?}"),
    })?;
    Ok(Pdfium::new(bindings))
}

fn open_error(e: PdfiumError) -> PipelineError {
    let detail = format!("{e:?}");
    if detail.to_lowercase().contains("password") {
        PipelineError::UnreadableDocument {
            detail: "PDF is password-protected".to_string(),
        }
    } else {
        PipelineError::UnreadableDocument { detail }
    }
}

/// Read the text layer of every page.
pub async fn extract_text(
    bytes: Arc<Vec<u8>>,
    lib_dir: Option<PathBuf>,
) -> Result<PdfText, PipelineError> {
    tokio::task::spawn_blocking(move || extract_text_blocking(&bytes, lib_dir.as_deref()))
        .await
        .map_err(|e| PipelineError::Internal(format!("PDF text task panicked: {e}")))?
}

fn extract_text_blocking(bytes: &[u8], lib_dir: Option<&Path>) -> Result<PdfText, PipelineError> {
    let pdfium = bind(lib_dir)?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(open_error)?;

    let pages = document.pages();
    let page_count = pages.len() as usize;
    let mut out = Vec::with_capacity(page_count);

    for (idx, page) in pages.iter().enumerate() {
        match page.text() {
            Ok(text) => out.push(text.all()),
            Err(e) => {
                warn!("Page {}: no text layer ({:?})", idx + 1, e);
                out.push(String::new());
            }
        }
    }

    info!(pages = page_count, "Read PDF text layer");
    Ok(PdfText {
        page_count,
        pages: out,
    })
}

/// Rasterise the first `max_pages` pages.
///
/// Returns `(page_index_0based, image)` pairs.
pub async fn render_pages(
    bytes: Arc<Vec<u8>>,
    lib_dir: Option<PathBuf>,
    max_pixels: u32,
    max_pages: usize,
) -> Result<Vec<(usize, DynamicImage)>, PipelineError> {
    tokio::task::spawn_blocking(move || {
        render_pages_blocking(&bytes, lib_dir.as_deref(), max_pixels, max_pages)
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Render task panicked: {e}")))?
}

fn render_pages_blocking(
    bytes: &[u8],
    lib_dir: Option<&Path>,
    max_pixels: u32,
    max_pages: usize,
) -> Result<Vec<(usize, DynamicImage)>, PipelineError> {
    let pdfium = bind(lib_dir)?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(open_error)?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let pages = document.pages();
    let total = pages.len() as usize;
    if total > max_pages {
        warn!("Rendering only the first {} of {} pages", max_pages, total);
    }

    let mut results = Vec::with_capacity(total.min(max_pages));
    for (idx, page) in pages.iter().enumerate().take(max_pages) {
        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| PipelineError::ExtractionFailed {
                    reason: format!("rasterising page {} failed: {e:?}", idx + 1),
                })?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        results.push((idx, image));
    }

    Ok(results)
}
