//! Validation policy: is this extracted text worth analysing?
//!
//! Text is rejected when it is empty, shorter than a minimum number of
//! non-whitespace characters, has too few words, or is dominated by
//! characters that no real document contains (control codes, the Unicode
//! replacement character, private-use code points, box-drawing noise that
//! OCR engines emit for smudges). All thresholds live in
//! [`ValidationPolicy`] and are set through configuration.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// Thresholds for [`ValidationPolicy::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    /// Minimum count of non-whitespace characters. Default: 20.
    pub min_chars: usize,
    /// Minimum count of whitespace-separated words. Default: 3.
    pub min_words: usize,
    /// Maximum share (0.0–1.0) of garbage among non-whitespace characters. Default: 0.30.
    pub max_garbage_ratio: f32,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            min_chars: 20,
            min_words: 3,
            max_garbage_ratio: 0.30,
        }
    }
}

/// Outcome of a validation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl Validation {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }

    /// Turn a rejection into [`PipelineError::Validation`].
    pub fn into_result(self) -> Result<(), PipelineError> {
        if self.valid {
            Ok(())
        } else {
            Err(PipelineError::Validation {
                reason: self.reason.unwrap_or_else(|| "rejected".to_string()),
            })
        }
    }
}

impl ValidationPolicy {
    pub fn validate(&self, text: &str) -> Validation {
        let stats = TextStats::of(text);

        if stats.visible == 0 {
            return Validation::reject("text is empty".to_string());
        }
        if stats.visible < self.min_chars {
            return Validation::reject(format!(
                "text too short: {} characters (minimum {})",
                stats.visible, self.min_chars
            ));
        }
        let ratio = stats.garbage_ratio();
        if ratio > self.max_garbage_ratio {
            return Validation::reject(format!(
                "garbage ratio {:.2} exceeds {:.2}",
                ratio, self.max_garbage_ratio
            ));
        }
        if stats.words < self.min_words {
            return Validation::reject(format!(
                "too few words: {} (minimum {})",
                stats.words, self.min_words
            ));
        }
        Validation::ok()
    }

    /// Check the policy's own thresholds.
    pub fn check(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.max_garbage_ratio) {
            return Err(PipelineError::InvalidConfig(format!(
                "max_garbage_ratio must be 0.0–1.0, got {}",
                self.max_garbage_ratio
            )));
        }
        Ok(())
    }
}

/// Share (0.0–1.0) of readable characters among non-whitespace ones.
///
/// Used as a confidence estimate when an OCR backend reports none.
pub fn readable_ratio(text: &str) -> f32 {
    let stats = TextStats::of(text);
    if stats.visible == 0 {
        0.0
    } else {
        1.0 - stats.garbage_ratio()
    }
}

struct TextStats {
    visible: usize,
    garbage: usize,
    words: usize,
}

impl TextStats {
    fn of(text: &str) -> Self {
        let mut visible = 0;
        let mut garbage = 0;
        for c in text.chars().filter(|c| !c.is_whitespace()) {
            visible += 1;
            if is_garbage(c) {
                garbage += 1;
            }
        }
        let words = text
            .split_whitespace()
            .filter(|w| w.chars().any(char::is_alphanumeric))
            .count();
        Self {
            visible,
            garbage,
            words,
        }
    }

    fn garbage_ratio(&self) -> f32 {
        if self.visible == 0 {
            0.0
        } else {
            self.garbage as f32 / self.visible as f32
        }
    }
}

fn is_garbage(c: char) -> bool {
    c.is_control()
        || c == '\u{FFFD}'
        || ('\u{E000}'..='\u{F8FF}').contains(&c)
        || ('\u{F0000}'..='\u{10FFFF}').contains(&c)
        || ('\u{2500}'..='\u{259F}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ValidationPolicy {
        ValidationPolicy::default()
    }

    #[test]
    fn accepts_ordinary_prose() {
        let v = policy().validate("The quick brown fox jumps over the lazy dog.");
        assert!(v.valid, "{:?}", v.reason);
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert_eq!(
            policy().validate("").reason.as_deref(),
            Some("text is empty")
        );
        assert!(!policy().validate(" \n\t ").valid);
    }

    #[test]
    fn rejects_short_text() {
        let v = policy().validate("Invoice 42");
        assert!(!v.valid);
        assert!(v.reason.unwrap().contains("too short"));
    }

    #[test]
    fn rejects_garbage() {
        let text = "\u{FFFD}\u{FFFD}\u{FFFD}\u{FFFD}\u{FFFD}\u{FFFD}\u{FFFD}\u{FFFD} ▓▓▓▓▓▓ ░░░░ ok word";
        let v = policy().validate(text);
        assert!(!v.valid);
        assert!(v.reason.unwrap().contains("garbage ratio"));
    }

    #[test]
    fn rejects_too_few_words() {
        let v = policy().validate("Supercalifragilisticexpialidocious");
        assert!(!v.valid);
        assert!(v.reason.unwrap().contains("too few words"));
    }

    #[test]
    fn thresholds_are_configurable() {
        let lenient = ValidationPolicy {
            min_chars: 1,
            min_words: 1,
            max_garbage_ratio: 1.0,
        };
        assert!(lenient.validate("ok").valid);
    }

    #[test]
    fn rejection_maps_to_validation_error() {
        let err = policy().validate("").into_result().unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }

    #[test]
    fn readable_ratio_bounds() {
        assert_eq!(readable_ratio(""), 0.0);
        assert_eq!(readable_ratio("clean text"), 1.0);
        assert!(readable_ratio("ab\u{FFFD}\u{FFFD}") < 0.6);
    }

    #[test]
    fn check_rejects_out_of_range_ratio() {
        let bad = ValidationPolicy {
            max_garbage_ratio: 1.5,
            ..Default::default()
        };
        assert!(bad.check().is_err());
    }
}
