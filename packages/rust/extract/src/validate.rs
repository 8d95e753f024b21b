//! Content validation: the one place extracted text can be rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

use studydeck_shared::{Result, StudyDeckError};

use crate::{ExtractionResult, ExtractionWarning, SourceKind};

/// Text shorter than this (in characters) is rejected.
pub const MIN_CONTENT_CHARS: usize = 50;

/// Average word length above this suggests garbled extraction.
pub const MAX_AVG_WORD_LEN: f64 = 20.0;

/// Estimated token count above this marks a huge page.
pub const MAX_ESTIMATED_TOKENS: usize = 50_000;

/// Rough characters-per-token ratio for estimates.
const CHARS_PER_TOKEN: usize = 4;

/// Non-fatal signal about extracted content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationWarning {
    PossiblyGarbled { avg_word_len: f64 },
    VeryLarge { estimated_tokens: usize },
    MainContentNotFound,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PossiblyGarbled { avg_word_len } => write!(
                f,
                "average word length is {avg_word_len:.1} characters; the text may be garbled"
            ),
            Self::VeryLarge { estimated_tokens } => write!(
                f,
                "page is very large (~{estimated_tokens} tokens); processing may take a while"
            ),
            Self::MainContentNotFound => {
                f.write_str("no main content area found; using the whole page")
            }
        }
    }
}

/// Estimated token count for a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Check extracted content, returning warnings or `ContentTooShort`.
pub fn validate(result: &ExtractionResult) -> Result<Vec<ValidationWarning>> {
    let chars = result.text.trim().chars().count();
    if chars < MIN_CONTENT_CHARS {
        return Err(StudyDeckError::ContentTooShort {
            chars,
            min: MIN_CONTENT_CHARS,
        });
    }

    let mut warnings = Vec::new();

    let words: Vec<&str> = result.text.split_whitespace().collect();
    if !words.is_empty() {
        let letters: usize = words.iter().map(|w| w.chars().count()).sum();
        let avg_word_len = letters as f64 / words.len() as f64;
        if avg_word_len > MAX_AVG_WORD_LEN {
            warnings.push(ValidationWarning::PossiblyGarbled { avg_word_len });
        }
    }

    let estimated_tokens = estimate_tokens(&result.text);
    if estimated_tokens > MAX_ESTIMATED_TOKENS {
        warnings.push(ValidationWarning::VeryLarge { estimated_tokens });
    }

    // A raw fallback already tells the user the page structure was not used.
    let raw_fallback = result
        .warnings
        .iter()
        .any(|w| matches!(w, ExtractionWarning::RawFallback { .. }));
    if result.source_kind == SourceKind::FullBody && !raw_fallback {
        warnings.push(ValidationWarning::MainContentNotFound);
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(text: &str, kind: SourceKind) -> ExtractionResult {
        ExtractionResult::new(text.to_string(), kind, Vec::new())
    }

    #[test]
    fn short_text_is_rejected() {
        let err = validate(&result_with("too short", SourceKind::Selection)).unwrap_err();
        assert!(matches!(
            err,
            StudyDeckError::ContentTooShort { chars: 9, min: 50 }
        ));
    }

    #[test]
    fn boundary_length_is_accepted() {
        let text = "a".repeat(MIN_CONTENT_CHARS);
        assert!(validate(&result_with(&text, SourceKind::Selection)).is_ok());
    }

    #[test]
    fn clean_main_content_has_no_warnings() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(5);
        let warnings = validate(&result_with(&text, SourceKind::MainContent)).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn long_words_warn_garbled() {
        let text = format!("{} {}", "x".repeat(40), "y".repeat(40));
        let warnings = validate(&result_with(&text, SourceKind::MainContent)).unwrap();
        assert!(matches!(
            warnings[0],
            ValidationWarning::PossiblyGarbled { .. }
        ));
    }

    #[test]
    fn huge_text_warns() {
        let text = "word ".repeat(50_000);
        let warnings = validate(&result_with(&text, SourceKind::MainContent)).unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ValidationWarning::VeryLarge { .. }))
        );
    }

    #[test]
    fn full_body_warns_missing_main() {
        let text = "Plenty of ordinary words in this body of text here. ".repeat(2);
        let warnings = validate(&result_with(&text, SourceKind::FullBody)).unwrap();
        assert_eq!(warnings, vec![ValidationWarning::MainContentNotFound]);
    }

    #[test]
    fn raw_fallback_suppresses_missing_main() {
        let text = "Plenty of ordinary words in this body of text here. ".repeat(2);
        let result = ExtractionResult::new(
            text,
            SourceKind::FullBody,
            vec![ExtractionWarning::RawFallback {
                reason: "bad selector".into(),
            }],
        );
        assert!(validate(&result).unwrap().is_empty());
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
