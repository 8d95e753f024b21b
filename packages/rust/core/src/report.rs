//! Report prompt construction and the locally built references section.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use studydeck_shared::ReportSource;

/// Heading of the appended references section.
pub const REFERENCES_HEADING: &str = "References";

/// Build the synthesis prompt. `texts[i]` is the (possibly condensed) text of
/// `sources[i]`.
pub fn prompt(sources: &[ReportSource], texts: &[String]) -> String {
    let mut out = String::from(
        "Write a cohesive report that synthesizes the sources below into a single narrative.\n\
         Compare and connect their ideas instead of summarizing each one in turn.\n\
         Do not include a references or sources section; it will be added separately.\n",
    );
    for (i, (source, text)) in sources.iter().zip(texts).enumerate() {
        let _ = write!(out, "\nSOURCE {}: {}\n{}\n", i + 1, display_title(source), text.trim());
    }
    out
}

/// Remove a trailing references section the model emitted despite instructions.
///
/// The last references-style heading is only treated as a section start when
/// narrative precedes it and every non-blank line after it reads as a citation.
pub fn strip_model_references(text: &str) -> &str {
    static REFS_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?im)^[ \t]*(?:#{1,6}[ \t]*)?(?:\*\*)?(?:references|sources|bibliography|works cited)[ \t]*:?(?:\*\*)?[ \t]*:?[ \t]*$",
        )
        .expect("valid regex")
    });
    static CITATION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)^\s*(?:[-*+\u{2022}]\s|\d+[.)]\s|\[\d+\])|https?://|www\.")
            .expect("valid regex")
    });

    let text = text.trim_end();
    let Some(m) = REFS_RE.find_iter(text).last() else {
        return text;
    };
    let narrative = text[..m.start()].trim_end();
    let listed = text[m.end()..]
        .lines()
        .filter(|line| !line.trim().is_empty())
        .all(|line| CITATION_RE.is_match(line));

    if !narrative.is_empty() && listed {
        narrative
    } else {
        text
    }
}

/// `References` followed by `index. title - url` for every source in order.
pub fn format_references(sources: &[ReportSource]) -> String {
    let mut out = String::from(REFERENCES_HEADING);
    out.push('\n');
    for (i, source) in sources.iter().enumerate() {
        let _ = write!(out, "\n{}. {} - {}", i + 1, display_title(source), source.url.trim());
    }
    out
}

fn display_title(source: &ReportSource) -> &str {
    match source.title.trim() {
        "" => "Untitled",
        title => title,
    }
}

/// Final report text: narrative without model references, then ours.
pub fn assemble(narrative: &str, sources: &[ReportSource]) -> String {
    format!(
        "{}\n\n{}",
        strip_model_references(narrative).trim(),
        format_references(sources)
    )
}
