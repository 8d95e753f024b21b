//! Semantic chunking of normalized text.
//!
//! Splits text into heading-delimited sections, then packs sections greedily
//! into chunks no larger than `max_size` characters. Each chunk after the first
//! starts with the last `overlap` characters of its predecessor so the model
//! sees trailing context across boundaries. Consumers must tolerate that
//! duplicated prefix; [`Chunk::body`] returns the chunk's own content.

mod sections;

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::debug;

use studydeck_shared::ChunkingConfig;

use sections::{Split, char_len, split_sections, split_to_fit, tail_chars};

pub use sections::is_heading;

/// A bounded slice of source text, the unit of work for the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Overlap prefix followed by this chunk's own body.
    pub text: String,
    pub index: usize,
    pub total_count: usize,
    /// Headings of the sections this chunk covers, in order.
    pub headings: Vec<String>,
    /// Byte length of the prefix copied from the previous chunk.
    pub overlap_len: usize,
}

impl Chunk {
    /// The chunk's text without the injected overlap prefix.
    pub fn body(&self) -> &str {
        &self.text[self.overlap_len..]
    }

    /// First heading covered by this chunk, if any.
    pub fn primary_heading(&self) -> Option<&str> {
        self.headings.first().map(String::as_str)
    }
}

/// A section (or a piece of an oversized one) as a byte range of the source.
struct Unit {
    range: Range<usize>,
    heading: Option<String>,
}

/// A chunk being assembled.
struct Draft {
    prefix: String,
    body: Range<usize>,
    chars: usize,
    headings: Vec<String>,
}

impl Draft {
    fn new(prefix: String, start: usize) -> Self {
        let chars = char_len(&prefix);
        Self {
            prefix,
            body: start..start,
            chars,
            headings: Vec::new(),
        }
    }

    fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    fn push(&mut self, text: &str, unit: &Unit) {
        self.body.end = unit.range.end;
        self.chars += char_len(&text[unit.range.clone()]);
        if let Some(h) = &unit.heading {
            push_heading(&mut self.headings, h);
        }
    }

    fn text(&self, source: &str) -> String {
        format!("{}{}", self.prefix, &source[self.body.clone()])
    }
}

fn push_heading(headings: &mut Vec<String>, heading: &str) {
    if headings.last().map(String::as_str) != Some(heading) {
        headings.push(heading.to_string());
    }
}

/// Re-split the combined bodies of the last two drafts near their midpoint.
///
/// Returns `None` when no break point keeps both halves within `max_size`.
fn rebalance(
    text: &str,
    prev: &Draft,
    tail: &Draft,
    units: &[Unit],
    config: &ChunkingConfig,
) -> Option<(Draft, Draft)> {
    let start = prev.body.start;
    let segment = &text[start..tail.body.end];
    let half = segment
        .char_indices()
        .nth(char_len(segment) / 2)
        .map_or(segment.len(), |(i, _)| i);
    let before = &segment[..half];
    let after_break = |pred: fn(char) -> bool| {
        before
            .char_indices()
            .rev()
            .find(|&(_, c)| pred(c))
            .map(|(i, c)| i + c.len_utf8())
    };
    let candidates = [after_break(|c| c == '\n'), after_break(char::is_whitespace), Some(half)];

    let prefix_chars = char_len(&prev.prefix);
    candidates
        .into_iter()
        .flatten()
        .filter(|&at| at > 0 && at < segment.len())
        .find_map(|at| {
            let first_chars = prefix_chars + char_len(&segment[..at]);
            if first_chars > config.max_size {
                return None;
            }
            let first = Draft {
                prefix: prev.prefix.clone(),
                body: start..start + at,
                chars: first_chars,
                headings: headings_in(units, start..start + at),
            };
            let prefix = tail_chars(&first.text(text), config.overlap).to_string();
            let second_chars = char_len(&prefix) + char_len(&segment[at..]);
            if second_chars > config.max_size {
                return None;
            }
            let second = Draft {
                prefix,
                body: start + at..tail.body.end,
                chars: second_chars,
                headings: headings_in(units, start + at..tail.body.end),
            };
            Some((first, second))
        })
}

fn headings_in(units: &[Unit], range: Range<usize>) -> Vec<String> {
    let mut headings = Vec::new();
    for unit in units
        .iter()
        .filter(|u| u.range.start < range.end && range.start < u.range.end)
    {
        if let Some(h) = &unit.heading {
            push_heading(&mut headings, h);
        }
    }
    headings
}

/// Split `text` into chunks according to `config`.
pub fn chunk(text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    if char_len(text) <= config.max_size {
        let trimmed = text.trim();
        let mut headings = Vec::new();
        for line in trimmed.lines().filter(|l| is_heading(l)) {
            push_heading(&mut headings, line.trim());
        }
        return vec![Chunk {
            text: trimmed.to_string(),
            index: 0,
            total_count: 1,
            headings,
            overlap_len: 0,
        }];
    }

    // Leave room for the overlap prefix in every chunk.
    let cap = config.max_size.saturating_sub(config.overlap).max(1);

    let units: Vec<Unit> = split_sections(text)
        .into_iter()
        .flat_map(|section| {
            split_to_fit(text, section.range, cap, Split::Lines)
                .into_iter()
                .map(move |range| Unit {
                    range,
                    heading: section.heading.clone(),
                })
        })
        .collect();

    let mut drafts: Vec<Draft> = Vec::new();
    let mut current = Draft::new(String::new(), 0);

    for unit in &units {
        let unit_chars = char_len(&text[unit.range.clone()]);
        if current.has_body() && current.chars + unit_chars > config.max_size {
            let sealed = current.text(text);
            let prefix = tail_chars(&sealed, config.overlap).to_string();
            drafts.push(current);
            current = Draft::new(prefix, unit.range.start);
        }
        current.push(text, unit);
    }
    if current.has_body() {
        drafts.push(current);
    }

    // A small trailing chunk is folded into its predecessor when it fits,
    // otherwise the last two bodies are rebalanced.
    if let [.., prev, tail] = drafts.as_mut_slice() {
        let tail_len = char_len(text[tail.body.clone()].trim());
        if tail_len < config.min_size {
            let tail_chars_total = char_len(&text[tail.body.clone()]);
            if prev.chars + tail_chars_total <= config.max_size {
                debug!(tail_len, "folding short trailing chunk into predecessor");
                prev.body.end = tail.body.end;
                for h in &tail.headings {
                    push_heading(&mut prev.headings, h);
                }
                drafts.pop();
            } else if let Some((first, second)) = rebalance(text, prev, tail, &units, config) {
                debug!(tail_len, "rebalancing short trailing chunk with predecessor");
                *prev = first;
                *tail = second;
            } else {
                debug!(tail_len, "keeping short trailing chunk");
            }
        }
    }

    let total_count = drafts.len();
    debug!(total_count, source_chars = char_len(text), "chunking complete");

    drafts
        .into_iter()
        .enumerate()
        .map(|(index, draft)| Chunk {
            text: draft.text(text),
            index,
            total_count,
            overlap_len: draft.prefix.len(),
            headings: draft.headings,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_size: usize, min_size: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            max_size,
            min_size,
            overlap,
        }
    }

    fn paragraph(word: &str, words: usize) -> String {
        let mut p = vec![word; words].join(" ");
        p.push('\n');
        p
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk("  Short text.\n", &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Short text.");
        assert_eq!(chunks[0].total_count, 1);
        assert_eq!(chunks[0].overlap_len, 0);
    }

    #[test]
    fn single_chunk_collects_headings() {
        let chunks = chunk("INTRO\nbody\nDetails:\nmore", &ChunkingConfig::default());
        assert_eq!(chunks[0].headings, vec!["INTRO", "Details:"]);
    }

    #[test]
    fn sections_are_packed_and_overlapped() {
        let text = format!(
            "OVERVIEW\n{}BACKGROUND\n{}RESULTS\n{}",
            paragraph("alpha", 40),
            paragraph("beta", 40),
            paragraph("gamma", 40)
        );
        let chunks = chunk(&text, &config(300, 10, 20));

        assert!(chunks.len() >= 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(c.total_count, chunks.len());
        }
        for pair in chunks.windows(2) {
            let expected = tail_chars(&pair[0].text, 20);
            assert!(pair[1].text.starts_with(expected));
            assert_eq!(pair[1].overlap_len, expected.len());
        }
        assert_eq!(chunks[0].headings[0], "OVERVIEW");
    }

    #[test]
    fn bodies_reconstruct_source() {
        let text = format!(
            "preamble line\n{}SECTION ONE\n{}\nPart two:\n{}",
            paragraph("one", 120),
            paragraph("two", 120),
            paragraph("three", 120)
        );
        let chunks = chunk(&text, &config(500, 50, 60));
        let rebuilt: String = chunks.iter().map(Chunk::body).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn chunks_respect_max_size() {
        let text = (0..30)
            .map(|i| format!("HEADING {i}\n{}", paragraph("word", 25)))
            .collect::<String>();
        let chunks = chunk(&text, &config(400, 20, 50));
        for c in &chunks {
            assert!(char_len(&c.text) <= 400, "chunk {} too large", c.index);
        }
    }

    #[test]
    fn oversized_section_splits_on_word_boundaries() {
        let text = paragraph("lorem", 500);
        let chunks = chunk(&text, &config(300, 10, 30));
        assert!(chunks.len() > 1);
        for c in &chunks[..chunks.len() - 1] {
            assert!(
                c.body().ends_with(' ') || c.body().ends_with('\n'),
                "chunk {} cuts a word: {:?}",
                c.index,
                &c.body()[c.body().len().saturating_sub(10)..]
            );
        }
        let rebuilt: String = chunks.iter().map(Chunk::body).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn small_tail_is_folded_into_previous_chunk() {
        let text = format!("{}TAIL\nend\n", paragraph("word", 100));
        let chunks = chunk(&text, &config(450, 100, 20));
        let last = chunks.last().unwrap();
        assert!(last.body().ends_with("TAIL\nend\n"));
        assert!(char_len(last.body().trim()) >= 100);
        assert!(last.headings.contains(&"TAIL".to_string()));
    }

    #[test]
    fn short_tail_after_full_chunk_stays_within_max_size() {
        let body = "alpha beta gamma delta epsilon\n".repeat(316);
        let tail = paragraph("closing", 37);
        let text = format!("{body}TAIL\n{tail}");
        let chunks = chunk(&text, &config(10_000, 500, 200));

        assert_eq!(chunks.len(), 2);
        for c in &chunks {
            assert!(char_len(&c.text) <= 10_000, "chunk {} is {} chars", c.index, char_len(&c.text));
        }
        assert!(char_len(chunks[1].body().trim()) >= 500);
        assert_eq!(chunks[1].headings, vec!["TAIL"]);
        let rebuilt: String = chunks.iter().map(Chunk::body).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn continuation_chunks_keep_section_heading() {
        let text = format!("CHAPTER\n{}", paragraph("long", 300));
        let chunks = chunk(&text, &config(400, 10, 20));
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.primary_heading() == Some("CHAPTER")));
    }

    #[test]
    fn multibyte_text_is_safe() {
        let text = "é".repeat(1_000) + "\n" + &"ü ".repeat(600);
        let chunks = chunk(&text, &config(300, 10, 25));
        let rebuilt: String = chunks.iter().map(Chunk::body).collect();
        assert_eq!(rebuilt, text);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn line() -> impl Strategy<Value = String> {
            prop_oneof![
                "[A-Z]{3,12}",
                "[A-Za-z ]{3,30}:",
                "[a-z]{1,9}( [a-z]{1,9}){0,20}\\.",
                Just(String::new()),
            ]
        }

        proptest! {
            #[test]
            fn short_text_roundtrips(t in "[ -~\n]{0,400}") {
                let chunks = chunk(&t, &config(500, 50, 40));
                prop_assert_eq!(chunks.len(), 1);
                prop_assert_eq!(chunks[0].text.as_str(), t.trim());
            }

            #[test]
            fn long_text_sections_stay_in_order(lines in prop::collection::vec(line(), 20..120)) {
                let text = lines.join("\n");
                prop_assume!(char_len(&text) > 300);
                let chunks = chunk(&text, &config(300, 40, 30));
                let rebuilt: String = chunks.iter().map(Chunk::body).collect();
                prop_assert_eq!(rebuilt, text);
                for c in &chunks {
                    prop_assert_eq!(c.total_count, chunks.len());
                    prop_assert!(char_len(&c.text) <= 300);
                }
            }
        }
    }
}
