//! Deterministic cleanup of extracted text before validation.
//!
//! Native PDF text and VLM transcriptions both carry noise that is not
//! content: CRLF line endings, trailing blanks, long runs of empty lines,
//! zero-width characters, and (for VLM output) a Markdown fence around the
//! whole answer. Each rule is a small pure function so it can be tested on
//! its own.
//!
//! Rule order matters: line endings are normalised first so the fence regex
//! only has to match `\n`, and invisible characters are removed before
//! trailing whitespace is trimmed.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every cleanup rule in order.
///
/// 1. Normalise line endings (CRLF / CR → LF)
/// 2. Strip an outer code fence
/// 3. Remove invisible Unicode (zero-width, BOM, soft hyphen)
/// 4. Trim trailing whitespace per line
/// 5. Collapse 3+ blank lines down to 2
/// 6. Trim leading and trailing blank lines
pub fn clean_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_outer_fence(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

static RE_OUTER_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*\n(.*)\n```\s*$").expect("outer fence regex is valid")
});

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{4,}").expect("blank run regex is valid"));

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_RUN.replace_all(input, "\n\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fence_with_language_tag() {
        assert_eq!(strip_outer_fence("```text\nInvoice 42\n```"), "Invoice 42");
        assert_eq!(strip_outer_fence("```\nA\nB\n```"), "A\nB");
    }

    #[test]
    fn inner_fences_are_kept() {
        let input = "Intro\n```\ncode\n```\nOutro";
        assert_eq!(strip_outer_fence(input), input);
    }

    #[test]
    fn normalises_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn removes_invisible_characters() {
        assert_eq!(
            remove_invisible_chars("in\u{200B}voice\u{FEFF} to\u{00AD}tal"),
            "invoice total"
        );
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\n\nb");
    }

    #[test]
    fn full_cleanup() {
        let input = "```\r\nPage one   \r\n\r\n\r\n\r\n\r\n\r\nPage two\u{200B}\r\n```";
        assert_eq!(clean_text(input), "Page one\n\n\nPage two");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(clean_text(""), "");
        assert_eq!(clean_text("\n\n  \n"), "");
    }
}
