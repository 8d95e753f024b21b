//! Whitespace normalization pipeline for extracted text.
//!
//! Each pass is a function `&str -> String` applied in sequence.

use std::sync::LazyLock;

use regex::Regex;

/// Run the full normalization pipeline on raw extracted text.
pub(crate) fn normalize(text: &str) -> String {
    let mut result = unify_line_endings(text);

    result = replace_nbsp(&result);
    result = collapse_inline_whitespace(&result);
    result = trim_lines(&result);
    result = collapse_blank_lines(&result);

    result.trim().to_string()
}

// ---------------------------------------------------------------------------
// Pass 1: Line endings
// ---------------------------------------------------------------------------

/// Convert `\r\n` and lone `\r` to `\n`.
fn unify_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

// ---------------------------------------------------------------------------
// Pass 2: Non-breaking spaces
// ---------------------------------------------------------------------------

fn replace_nbsp(text: &str) -> String {
    text.replace(['\u{a0}', '\u{2007}', '\u{202f}'], " ")
}

// ---------------------------------------------------------------------------
// Pass 3: Collapse spaces and tabs
// ---------------------------------------------------------------------------

/// Collapse runs of spaces, tabs, and form feeds into a single space.
fn collapse_inline_whitespace(text: &str) -> String {
    static INLINE_WS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[ \t\x0B\x0C]+").expect("valid regex"));

    INLINE_WS_RE.replace_all(text, " ").to_string()
}

// ---------------------------------------------------------------------------
// Pass 4: Trim each line
// ---------------------------------------------------------------------------

fn trim_lines(text: &str) -> String {
    text.lines().map(str::trim).collect::<Vec<_>>().join("\n")
}

// ---------------------------------------------------------------------------
// Pass 5: Collapse blank lines
// ---------------------------------------------------------------------------

/// Collapse runs of blank lines into at most one blank line.
fn collapse_blank_lines(text: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(text, "\n\n").to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
