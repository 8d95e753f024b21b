//! Section detection and range splitting.
//!
//! Everything here works on byte ranges of the source so that chunk bodies
//! always concatenate back to the exact input.

use std::ops::Range;

const UPPERCASE_HEADING_MAX: usize = 80;
const COLON_HEADING_MAX: usize = 100;

pub(crate) struct Section {
    pub range: Range<usize>,
    pub heading: Option<String>,
}

/// Granularity used when a range is too large to fit in one chunk.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Split {
    Lines,
    Words,
    Chars,
}

impl Split {
    fn finer(self) -> Self {
        match self {
            Self::Lines => Self::Words,
            Self::Words | Self::Chars => Self::Chars,
        }
    }
}

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Whether a line looks like a section heading.
///
/// Short all-caps lines (at least one letter, no lowercase) and lines ending
/// in a colon count.
pub fn is_heading(line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    let len = char_len(line);

    let shouting = len < UPPERCASE_HEADING_MAX
        && line.chars().any(char::is_alphabetic)
        && !line.chars().any(char::is_lowercase);
    let labelled = len < COLON_HEADING_MAX && line.ends_with(':');

    shouting || labelled
}

/// Partition `text` into contiguous sections, each starting at a heading line
/// (except possibly the first).
pub(crate) fn split_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut start = 0;
    let mut heading: Option<String> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if is_heading(line) && offset > start {
            sections.push(Section {
                range: start..offset,
                heading: heading.take(),
            });
            start = offset;
        }
        if is_heading(line) && offset == start {
            heading = Some(line.trim().to_string());
        }
        offset += line.len();
    }

    if offset > start {
        sections.push(Section {
            range: start..offset,
            heading,
        });
    }

    sections
}

/// Split `range` of `text` into consecutive pieces of at most `cap` chars,
/// breaking at the coarsest boundary that works.
pub(crate) fn split_to_fit(
    text: &str,
    range: Range<usize>,
    cap: usize,
    level: Split,
) -> Vec<Range<usize>> {
    let segment = &text[range.clone()];
    if char_len(segment) <= cap {
        return vec![range];
    }

    let parts: Vec<&str> = match level {
        Split::Lines => segment.split_inclusive('\n').collect(),
        Split::Words => segment.split_inclusive(char::is_whitespace).collect(),
        Split::Chars => return hard_split(range.start, segment, cap),
    };

    let mut pieces = Vec::new();
    let mut offset = range.start;
    let mut piece_start = range.start;
    let mut piece_chars = 0;

    for part in parts {
        let part_range = offset..offset + part.len();
        offset = part_range.end;
        let n = char_len(part);

        if n > cap {
            if piece_chars > 0 {
                pieces.push(piece_start..part_range.start);
            }
            pieces.extend(split_to_fit(text, part_range.clone(), cap, level.finer()));
            piece_start = part_range.end;
            piece_chars = 0;
            continue;
        }

        if piece_chars + n > cap {
            pieces.push(piece_start..part_range.start);
            piece_start = part_range.start;
            piece_chars = 0;
        }
        piece_chars += n;
    }

    if piece_chars > 0 {
        pieces.push(piece_start..range.end);
    }

    pieces
}

fn hard_split(base: usize, segment: &str, cap: usize) -> Vec<Range<usize>> {
    let mut pieces = Vec::new();
    let mut piece_start = 0;

    for (count, (idx, _)) in segment.char_indices().enumerate() {
        if count > 0 && count % cap == 0 {
            pieces.push(base + piece_start..base + idx);
            piece_start = idx;
        }
    }
    pieces.push(base + piece_start..base + segment.len());

    pieces
}

/// The last `n` characters of `s`.
pub(crate) fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    s.char_indices()
        .rev()
        .nth(n - 1)
        .map_or(s, |(idx, _)| &s[idx..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_headings() {
        assert!(is_heading("INTRODUCTION"));
        assert!(is_heading("  CHAPTER 2  "));
        assert!(is_heading("Key findings:"));
        assert!(!is_heading("A normal sentence."));
        assert!(!is_heading("2024"));
        assert!(!is_heading(""));
        assert!(!is_heading(&"A".repeat(80)));
        assert!(!is_heading(&format!("{}:", "a".repeat(100))));
    }

    #[test]
    fn sections_cover_the_whole_text() {
        let text = "intro text\nFIRST\nbody one\nSecond part:\nbody two";
        let sections = split_sections(text);

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].heading, None);
        assert_eq!(sections[1].heading.as_deref(), Some("FIRST"));
        assert_eq!(sections[2].heading.as_deref(), Some("Second part:"));

        let rebuilt: String = sections.iter().map(|s| &text[s.range.clone()]).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn leading_heading_opens_first_section() {
        let sections = split_sections("TITLE\nbody\n");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].heading.as_deref(), Some("TITLE"));
    }

    #[test]
    fn split_prefers_lines_then_words() {
        let text = "aaaa bbbb\ncccc dddd\neeee";
        let pieces = split_to_fit(text, 0..text.len(), 10, Split::Lines);
        let rendered: Vec<&str> = pieces.iter().map(|r| &text[r.clone()]).collect();
        assert_eq!(rendered, vec!["aaaa bbbb\n", "cccc dddd\n", "eeee"]);

        let text = "one two three four five";
        let pieces = split_to_fit(text, 0..text.len(), 9, Split::Lines);
        let rendered: Vec<&str> = pieces.iter().map(|r| &text[r.clone()]).collect();
        assert_eq!(rendered, vec!["one two ", "three ", "four five"]);
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let text = "ééééé";
        let pieces = split_to_fit(text, 0..text.len(), 2, Split::Lines);
        let rendered: Vec<&str> = pieces.iter().map(|r| &text[r.clone()]).collect();
        assert_eq!(rendered, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn tail_chars_counts_characters() {
        assert_eq!(tail_chars("hello", 3), "llo");
        assert_eq!(tail_chars("hé", 1), "é");
        assert_eq!(tail_chars("ab", 10), "ab");
        assert_eq!(tail_chars("ab", 0), "");
    }
}
