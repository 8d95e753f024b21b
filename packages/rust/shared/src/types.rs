//! Core domain types shared by the pipeline crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for task identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new time-sortable task identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// ContentFingerprint
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of normalized source text, used as a deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(pub String);

impl ContentFingerprint {
    /// Fingerprint a piece of (already normalized) text.
    pub fn of(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Fingerprint several parts as one, with separators so that
    /// `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn of_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Operations and task status
// ---------------------------------------------------------------------------

/// The three study operations the pipeline can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Summarize,
    Flashcards,
    Report,
}

impl OperationType {
    pub const ALL: [OperationType; 3] = [Self::Summarize, Self::Flashcards, Self::Report];

    /// Storage key for timing history and the result cache.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Flashcards => "flashcards",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "summarize" => Ok(Self::Summarize),
            "flashcards" => Ok(Self::Flashcards),
            "report" => Ok(Self::Report),
            other => Err(format!("unknown operation type '{other}'")),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Errored,
}

impl TaskStatus {
    /// `Pending` or `Running`.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// One observed task duration, fed back into the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub operation: OperationType,
    /// Chunks processed, or sources for a report.
    pub unit_count: u32,
    pub actual_seconds: f64,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Summary options
// ---------------------------------------------------------------------------

/// Style of summary requested from the summarizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryType {
    #[default]
    KeyPoints,
    Tldr,
    Teaser,
    Headline,
}

/// Requested summary verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryLength {
    Short,
    #[default]
    Medium,
    Long,
}

/// Output markup of a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryFormat {
    #[default]
    Markdown,
    PlainText,
}

macro_rules! kebab_enum_str {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(format!("unknown value '{other}'")),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

kebab_enum_str!(SummaryType {
    KeyPoints => "key-points",
    Tldr => "tldr",
    Teaser => "teaser",
    Headline => "headline",
});

kebab_enum_str!(SummaryLength {
    Short => "short",
    Medium => "medium",
    Long => "long",
});

kebab_enum_str!(SummaryFormat {
    Markdown => "markdown",
    PlainText => "plain-text",
});

/// Caller-facing summarization parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SummaryOptions {
    #[serde(rename = "type")]
    pub kind: SummaryType,
    pub length: SummaryLength,
    pub format: SummaryFormat,
    /// Output language tag (e.g. `en`); service default when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl SummaryOptions {
    /// Same options with a different length.
    pub fn with_length(&self, length: SummaryLength) -> Self {
        Self {
            length,
            ..self.clone()
        }
    }

    /// Stable key for caching results produced with these options.
    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind,
            self.length,
            self.format,
            self.language.as_deref().unwrap_or("default")
        )
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How partial chunk summaries were recombined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineStrategy {
    /// Input fit in one chunk; no combination needed.
    Single,
    /// Chunk summaries listed under their section headings.
    Sectioned,
    /// One more summarization pass over the joined chunk summaries.
    SummaryOfSummaries,
    /// Joined chunk summaries were too large for another pass.
    Concatenated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub text: String,
    pub chunk_count: usize,
    pub strategy: CombineStrategy,
}

/// A single multiple-choice flashcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flashcard {
    pub question: String,
    /// Always exactly four options.
    pub options: Vec<String>,
    /// Zero-based index into `options`.
    pub correct_index: usize,
    pub explanation: String,
}

impl Flashcard {
    pub const OPTION_COUNT: usize = 4;

    pub fn correct_option(&self) -> Option<&str> {
        self.options.get(self.correct_index).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashcardSet {
    pub cards: Vec<Flashcard>,
    pub chunk_count: usize,
}

/// One input document for report synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSource {
    pub title: String,
    pub url: String,
    /// Full or excerpted text of the source.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportResult {
    /// Narrative followed by the locally built references section.
    pub text: String,
    pub source_count: usize,
    /// How many sources were condensed before synthesis.
    pub presummarized: usize,
}

/// Result payload of a finished task, tagged by operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResult {
    Summary(SummaryResult),
    Flashcards(FlashcardSet),
    Report(ReportResult),
}

impl TaskResult {
    pub fn operation(&self) -> OperationType {
        match self {
            Self::Summary(_) => OperationType::Summarize,
            Self::Flashcards(_) => OperationType::Flashcards,
            Self::Report(_) => OperationType::Report,
        }
    }
}

impl From<SummaryResult> for TaskResult {
    fn from(result: SummaryResult) -> Self {
        Self::Summary(result)
    }
}

impl From<FlashcardSet> for TaskResult {
    fn from(set: FlashcardSet) -> Self {
        Self::Flashcards(set)
    }
}

impl From<ReportResult> for TaskResult {
    fn from(result: ReportResult) -> Self {
        Self::Report(result)
    }
}
