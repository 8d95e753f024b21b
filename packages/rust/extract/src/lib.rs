//! Main-content extraction, normalization, and validation.
//!
//! Takes a snapshot of a web page (its HTML plus the user's active selection,
//! if any), isolates the main readable text, and normalizes whitespace so the
//! chunker and the generation service see clean, line-oriented text.
//!
//! Extraction never fails: internal faults fall back to the raw document text
//! and attach an [`ExtractionWarning`]. Validation ([`validate`]) is the only
//! step that can reject content.

mod cleanup;
mod validate;

use std::fmt;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use studydeck_shared::{ContentFingerprint, Result, StudyDeckError};

pub use validate::{
    MAX_AVG_WORD_LEN, MAX_ESTIMATED_TOKENS, MIN_CONTENT_CHARS, ValidationWarning, estimate_tokens,
    validate,
};

/// A selection shorter than this falls back to page extraction.
pub const MIN_SELECTION_CHARS: usize = 10;

/// A content container must yield more than this many characters to win.
pub const MIN_CONTAINER_CHARS: usize = 100;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What the caller wants extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// The active selection, falling back to the page when it is too short.
    Selection,
    /// The page's main content.
    Page,
}

/// Where the extracted text actually came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Selection,
    MainContent,
    FullBody,
}

/// Snapshot of the document handed over by the host.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    /// Serialized HTML of the document.
    pub html: String,
    /// Text of the user's active selection, if any.
    pub selection: Option<String>,
}

impl PageSnapshot {
    pub fn from_html(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            selection: None,
        }
    }

    pub fn with_selection(mut self, selection: impl Into<String>) -> Self {
        self.selection = Some(selection.into());
        self
    }
}

/// Non-fatal issue encountered while extracting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionWarning {
    /// Structured extraction failed; the raw document text was used instead.
    RawFallback { reason: String },
}

impl fmt::Display for ExtractionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RawFallback { reason } => {
                write!(f, "content extraction fell back to raw page text ({reason})")
            }
        }
    }
}

/// Normalized text plus provenance. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub text: String,
    pub source_kind: SourceKind,
    pub found_main_content: bool,
    pub char_count: usize,
    pub word_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ExtractionWarning>,
}

impl ExtractionResult {
    fn new(text: String, source_kind: SourceKind, warnings: Vec<ExtractionWarning>) -> Self {
        let char_count = text.chars().count();
        let word_count = text.split_whitespace().count();
        Self {
            text,
            source_kind,
            found_main_content: source_kind == SourceKind::MainContent,
            char_count,
            word_count,
            warnings,
        }
    }

    /// Deduplication key for this content.
    pub fn fingerprint(&self) -> ContentFingerprint {
        ContentFingerprint::of(&self.text)
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract and normalize text from a page snapshot.
#[instrument(skip(snapshot), fields(html_len = snapshot.html.len()))]
pub fn extract(snapshot: &PageSnapshot, mode: SourceMode) -> ExtractionResult {
    extract_with(snapshot, mode, page_selectors())
}

fn extract_with(
    snapshot: &PageSnapshot,
    mode: SourceMode,
    selectors: Result<&Selectors>,
) -> ExtractionResult {
    if mode == SourceMode::Selection {
        if let Some(selection) = snapshot.selection.as_deref() {
            let text = cleanup::normalize(selection);
            if text.chars().count() >= MIN_SELECTION_CHARS {
                debug!(chars = text.len(), "using active selection");
                return ExtractionResult::new(text, SourceKind::Selection, Vec::new());
            }
        }
        debug!("selection empty or too short, falling back to page extraction");
    }

    match selectors {
        Ok(selectors) => {
            let (text, kind) = extract_page(&snapshot.html, selectors);
            debug!(?kind, chars = text.len(), "page extraction complete");
            ExtractionResult::new(text, kind, Vec::new())
        }
        Err(e) => {
            warn!(error = %e, "page extraction failed, using raw text");
            let warning = ExtractionWarning::RawFallback {
                reason: e.to_string(),
            };
            ExtractionResult::new(raw_text(&snapshot.html), SourceKind::FullBody, vec![warning])
        }
    }
}

/// Content containers in priority order: article-like, main-like,
/// role-designated, then class/id heuristics.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "[role=\"article\"]",
    "main",
    "[role=\"main\"]",
    "#main-content",
    "#content",
    "#main",
    ".post-content",
    ".entry-content",
    ".article-content",
    ".article-body",
    ".main-content",
    ".content",
    ".post",
    ".entry",
];

/// Sub-trees skipped while reading text.
const NOISE_SELECTOR: &str = "script, style, noscript, template, iframe, svg, canvas, \
     nav, header, footer, aside, form, button, dialog, \
     [role=\"navigation\"], [role=\"banner\"], [role=\"contentinfo\"], \
     [role=\"complementary\"], [role=\"dialog\"], [aria-modal=\"true\"], [aria-hidden=\"true\"], \
     .ad, .ads, .advert, .advertisement, .sponsored, .ad-slot, [id^=\"ad-\"], \
     .social, .social-share, .share, .share-buttons, .sharing, \
     .modal, .popup, .overlay, .cookie-banner, .cookie-consent, .newsletter, \
     .comments, #comments";

/// Elements rendered on their own line(s).
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption", "figure",
    "h1", "h2", "h3", "h4", "h5", "h6", "hr", "li", "main", "ol", "p", "pre", "section", "table",
    "td", "th", "tr", "ul",
];

struct Selectors {
    containers: Vec<Selector>,
    noise: Selector,
    body: Selector,
}

fn compile(sel: &str) -> Result<Selector> {
    Selector::parse(sel).map_err(|e| StudyDeckError::parse(format!("selector `{sel}`: {e}")))
}

fn compile_all() -> Result<Selectors> {
    Ok(Selectors {
        containers: CONTENT_SELECTORS
            .iter()
            .map(|s| compile(s))
            .collect::<Result<_>>()?,
        noise: compile(NOISE_SELECTOR)?,
        body: compile("body")?,
    })
}

fn page_selectors() -> Result<&'static Selectors> {
    static SELECTORS: LazyLock<std::result::Result<Selectors, String>> =
        LazyLock::new(|| compile_all().map_err(|e| e.to_string()));

    SELECTORS
        .as_ref()
        .map_err(|e| StudyDeckError::parse(e.clone()))
}

/// Pick the best content container and read its text.
fn extract_page(html: &str, selectors: &Selectors) -> (String, SourceKind) {
    let doc = Html::parse_document(html);

    for selector in &selectors.containers {
        for candidate in doc.select(selector) {
            let text = element_text(candidate, &selectors.noise);
            if text.chars().count() > MIN_CONTAINER_CHARS {
                return (text, SourceKind::MainContent);
            }
        }
    }

    let body = doc
        .select(&selectors.body)
        .next()
        .unwrap_or_else(|| doc.root_element());
    (element_text(body, &selectors.noise), SourceKind::FullBody)
}

/// Read the normalized text of `root`, skipping noise sub-trees.
///
/// Works on the parsed tree in place; nothing is removed from the document.
fn element_text(root: ElementRef<'_>, noise: &Selector) -> String {
    let mut raw = String::new();
    collect_text(root, noise, false, &mut raw);
    cleanup::normalize(&raw)
}

fn collect_text(el: ElementRef<'_>, noise: &Selector, in_pre: bool, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => {
                if in_pre {
                    out.push_str(text);
                } else {
                    // Source newlines are layout, not content.
                    out.extend(text.chars().map(|c| if c == '\n' { ' ' } else { c }));
                }
            }
            Node::Element(_) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                if noise.matches(&child_el) {
                    continue;
                }
                let name = child_el.value().name();
                let is_block = BLOCK_ELEMENTS.contains(&name);
                if is_block {
                    out.push('\n');
                }
                collect_text(child_el, noise, in_pre || name == "pre", out);
                if is_block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// Unprocessed document text, used when structured extraction fails.
fn raw_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    doc.root_element().text().collect::<String>()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn page(body: &str) -> PageSnapshot {
        PageSnapshot::from_html(format!("<html><head><title>T</title></head><body>{body}</body></html>"))
    }

    fn long_paragraph(word: &str) -> String {
        format!("<p>{}</p>", format!("{word} ").repeat(40))
    }

    #[test]
    fn main_container_scenario() {
        let content = "Hello world. ".repeat(50);
        let snapshot = page(&format!(
            "<nav>Home | About</nav><main>{content}</main><footer>Copyright</footer>"
        ));
        let result = extract(&snapshot, SourceMode::Page);

        assert!(result.found_main_content);
        assert_eq!(result.source_kind, SourceKind::MainContent);
        assert_eq!(result.text, content.trim());
        assert!((640..=700).contains(&result.char_count));
        assert_eq!(result.word_count, 100);
        assert!(!result.text.contains("Copyright"));
    }

    #[test]
    fn article_wins_over_main() {
        let snapshot = page(&format!(
            "<main><article>{}</article><p>{}</p></main>",
            long_paragraph("article"),
            "outside ".repeat(30)
        ));
        let result = extract(&snapshot, SourceMode::Page);
        assert_eq!(result.source_kind, SourceKind::MainContent);
        assert!(result.text.starts_with("article"));
        assert!(!result.text.contains("outside"));
    }

    #[test]
    fn small_container_is_skipped() {
        let snapshot = page(&format!(
            "<article>tiny</article><div class=\"content\">{}</div>",
            long_paragraph("body")
        ));
        let result = extract(&snapshot, SourceMode::Page);
        assert!(result.found_main_content);
        assert!(result.text.starts_with("body"));
    }

    #[test]
    fn falls_back_to_full_body() {
        let snapshot = page(&format!("<div>{}</div>", long_paragraph("plain")));
        let result = extract(&snapshot, SourceMode::Page);
        assert!(!result.found_main_content);
        assert_eq!(result.source_kind, SourceKind::FullBody);
        assert!(result.text.contains("plain"));
    }

    #[test]
    fn noise_subtrees_are_skipped() {
        let snapshot = page(&format!(
            r#"<article>
                <script>var tracking = 1;</script>
                <div class="share-buttons">Share on everything</div>
                <div class="modal">Subscribe now!</div>
                {}
                <aside>Related links</aside>
            </article>"#,
            long_paragraph("lesson")
        ));
        let result = extract(&snapshot, SourceMode::Page);
        assert!(result.text.contains("lesson"));
        assert!(!result.text.contains("tracking"));
        assert!(!result.text.contains("Share on"));
        assert!(!result.text.contains("Subscribe"));
        assert!(!result.text.contains("Related"));
    }

    #[test]
    fn extraction_does_not_mutate_snapshot() {
        let snapshot = page(&format!("<main><nav>menu</nav>{}</main>", long_paragraph("x")));
        let before = snapshot.html.clone();
        let _ = extract(&snapshot, SourceMode::Page);
        assert_eq!(snapshot.html, before);
    }

    #[test]
    fn block_elements_become_lines() {
        let snapshot = page(&format!(
            "<article><h2>INTRODUCTION</h2>{}<h2>Details:</h2>{}</article>",
            long_paragraph("alpha"),
            long_paragraph("beta")
        ));
        let result = extract(&snapshot, SourceMode::Page);
        let lines: Vec<&str> = result.text.lines().collect();
        assert_eq!(lines[0], "INTRODUCTION");
        assert!(lines.contains(&"Details:"));
        assert!(result.text.contains("\n\n") || lines.len() >= 4);
    }

    #[test]
    fn selection_is_preferred() {
        let snapshot = page(&format!("<main>{}</main>", long_paragraph("page")))
            .with_selection("  The   selected\tpassage of text.  ");
        let result = extract(&snapshot, SourceMode::Selection);
        assert_eq!(result.source_kind, SourceKind::Selection);
        assert_eq!(result.text, "The selected passage of text.");
        assert!(!result.found_main_content);
    }

    #[test]
    fn short_selection_falls_back_to_page() {
        let snapshot =
            page(&format!("<main>{}</main>", long_paragraph("page"))).with_selection("hi");
        let result = extract(&snapshot, SourceMode::Selection);
        assert_eq!(result.source_kind, SourceKind::MainContent);
        assert!(result.text.starts_with("page"));
    }

    #[test]
    fn missing_selection_falls_back_to_page() {
        let snapshot = page(&format!("<main>{}</main>", long_paragraph("page")));
        let result = extract(&snapshot, SourceMode::Selection);
        assert_eq!(result.source_kind, SourceKind::MainContent);
    }

    #[test]
    fn pre_keeps_line_breaks() {
        let snapshot = page(&format!(
            "<article>{}<pre>line one\nline two</pre></article>",
            long_paragraph("code")
        ));
        let result = extract(&snapshot, SourceMode::Page);
        assert!(result.text.contains("line one\nline two"));
    }

    #[test]
    fn plain_text_input_is_tolerated() {
        let snapshot = PageSnapshot::from_html("just some words without any markup at all");
        let result = extract(&snapshot, SourceMode::Page);
        assert_eq!(result.source_kind, SourceKind::FullBody);
        assert_eq!(result.text, "just some words without any markup at all");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn raw_text_keeps_everything() {
        let raw = raw_text("<body><nav>menu</nav><p>text</p></body>");
        assert!(raw.contains("menu"));
        assert!(raw.contains("text"));
    }

    #[test]
    fn fingerprint_tracks_text() {
        let a = extract(&page(&long_paragraph("same")), SourceMode::Page);
        let b = extract(&page(&long_paragraph("same")), SourceMode::Page);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn selector_failure_falls_back_to_raw_text() {
        let html = "<html><body><main><p>Kept   as\n raw</p></main><script>x()</script></body></html>";
        let broken = compile("div[").unwrap_err();
        let result = extract_with(&PageSnapshot::from_html(html), SourceMode::Page, Err(broken));

        assert_eq!(result.source_kind, SourceKind::FullBody);
        assert!(!result.found_main_content);
        assert_eq!(result.text, raw_text(html));
        assert!(result.text.contains("x()"));
        assert!(matches!(
            result.warnings.as_slice(),
            [ExtractionWarning::RawFallback { reason }] if reason.contains("div[")
        ));

        let warnings = validate(&ExtractionResult {
            text: "ordinary words ".repeat(10),
            ..result
        })
        .unwrap();
        assert!(!warnings.contains(&ValidationWarning::MainContentNotFound));
    }

    #[test]
    fn raw_fallback_warning_renders() {
        let w = ExtractionWarning::RawFallback {
            reason: "bad selector".into(),
        };
        assert!(w.to_string().contains("bad selector"));
    }
}
