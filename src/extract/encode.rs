//! Image preparation: decode uploads, cap their size, encode for the VLM.
//!
//! PNG is used for the request body because it is lossless; JPEG artefacts
//! around glyph edges measurably hurt transcription. `detail: "high"` asks
//! GPT-4-class models for the full tile budget so small print survives.

use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Decode an uploaded image (PNG, JPEG) into pixels.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    image::load_from_memory(bytes).map_err(|e| PipelineError::UnreadableDocument {
        detail: format!("cannot decode image: {e}"),
    })
}

/// Shrink `img` so its longest edge is at most `max_pixels`; smaller images
/// are returned untouched.
pub fn fit_within(img: DynamicImage, max_pixels: u32) -> DynamicImage {
    if img.width() <= max_pixels && img.height() <= max_pixels {
        return img;
    }
    let resized = img.resize(max_pixels, max_pixels, FilterType::Lanczos3);
    debug!(
        "Downscaled image {}x{} → {}x{}",
        img.width(),
        img.height(),
        resized.width(),
        resized.height()
    );
    resized
}

/// Encode a page image as a base64 PNG attachment.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, PipelineError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PipelineError::ExtractionFailed {
            reason: format!("PNG encoding failed: {e}"),
        })?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded page image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn solid(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255])))
    }

    #[test]
    fn encode_small_image() {
        let data = encode_page(&solid(10, 10)).unwrap();
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).unwrap();
        assert!(decoded.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn large_images_are_capped_on_longest_edge() {
        let img = fit_within(solid(400, 200), 100);
        assert_eq!(img.width(), 100);
        assert_eq!(img.height(), 50);

        let small = fit_within(solid(80, 60), 100);
        assert_eq!((small.width(), small.height()), (80, 60));
    }

    #[test]
    fn garbage_bytes_are_unreadable() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PipelineError::UnreadableDocument { .. }));
    }
}
