//! Prompts used by the intake pipeline.
//!
//! Every instruction sent to a model lives here, so a change to the OCR
//! contract (e.g. the confidence line format) is made in one place and
//! unit tests can inspect prompts without calling a model.

/// System prompt for transcribing a page image with a vision model.
///
/// The last line of the answer must be `CONFIDENCE: <0-100>`; the OCR
/// backend parses and strips it.
pub const OCR_SYSTEM_PROMPT: &str = r#"You are an OCR engine. Transcribe ALL text visible in the page image exactly as written.

Rules:
1. Preserve reading order as a human would read the page.
2. Keep line breaks between paragraphs; do not reflow tables, write one row per line with cells separated by " | ".
3. Do NOT translate, summarise, correct spelling, or add commentary.
4. Do NOT wrap the output in code fences.
5. If a region is illegible, write [illegible] in its place.
6. If the page holds no text at all, output nothing before the confidence line.
7. End with a single final line of the form:
CONFIDENCE: <integer 0-100>
   where the number is your estimate of how much of the page text you transcribed correctly."#;

/// Placeholder sent as `extractedText` when vision fallback leaves no text.
///
/// The downstream analysis worker reads the image at `imageUrl` instead.
pub const VISION_PLACEHOLDER: &str = "[Text extraction was not reliable for this document. \
Analyse the attached document image directly instead of this text.]";

/// Language hint appended to the OCR system prompt.
pub fn ocr_language_hint(language: &str) -> String {
    format!("The document language is most likely '{language}' (ISO 639 code).")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_prompt_requests_confidence_line() {
        assert!(OCR_SYSTEM_PROMPT.contains("CONFIDENCE:"));
    }

    #[test]
    fn language_hint_names_language() {
        assert!(ocr_language_hint("deu").contains("'deu'"));
    }
}
