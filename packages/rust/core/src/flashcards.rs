//! Flashcard prompt, schema, and tolerant parsing of model output.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use studydeck_shared::{Flashcard, Result, StudyDeckError};

/// JSON schema the structured session is constrained to.
pub fn schema() -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "question": { "type": "string" },
                "options": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": Flashcard::OPTION_COUNT,
                    "maxItems": Flashcard::OPTION_COUNT
                },
                "correct_index": {
                    "type": "integer",
                    "minimum": 0,
                    "maximum": Flashcard::OPTION_COUNT - 1
                },
                "explanation": { "type": "string" }
            },
            "required": ["question", "options", "correct_index", "explanation"]
        }
    })
}

pub fn prompt(count: usize, text: &str) -> String {
    format!(
        "Create {count} multiple-choice flashcards that test understanding of the text below.\n\
         Each flashcard has a question, exactly {options} answer options, the zero-based index \
         of the correct option, and a one-sentence explanation of why it is correct.\n\
         Respond with a JSON array only.\n\n\
         TEXT:\n{text}",
        options = Flashcard::OPTION_COUNT,
    )
}

/// Parse model output into flashcards.
///
/// Accepts a bare array or an object wrapping one. When direct parsing fails,
/// code fences are stripped and the outermost array literal is tried. Items
/// that cannot be normalized are dropped.
pub fn parse(raw: &str) -> Result<Vec<Flashcard>> {
    let items = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => find_array(value),
        Err(_) => None,
    }
    .or_else(|| fallback_array(raw))
    .ok_or_else(|| {
        StudyDeckError::format(format!(
            "expected a JSON array of flashcards, got: {}",
            preview(raw)
        ))
    })?;

    let total = items.len();
    let cards: Vec<Flashcard> = items.into_iter().filter_map(normalize).collect();
    if cards.len() < total {
        debug!(kept = cards.len(), total, "dropped malformed flashcards");
    }
    Ok(cards)
}

fn find_array(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.into_iter().find_map(|(_, v)| match v {
            Value::Array(items) => Some(items),
            _ => None,
        }),
        _ => None,
    }
}

fn fallback_array(raw: &str) -> Option<Vec<Value>> {
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"```[A-Za-z0-9_-]*").expect("valid regex"));

    let stripped = FENCE_RE.replace_all(raw, "");
    let start = stripped.find('[')?;
    let end = stripped.rfind(']')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&stripped[start..=end]) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

#[derive(Deserialize)]
struct RawCard {
    question: String,
    options: Vec<String>,
    #[serde(alias = "correctIndex", alias = "answer_index", alias = "answerIndex")]
    correct_index: i64,
    #[serde(default)]
    explanation: String,
}

fn normalize(item: Value) -> Option<Flashcard> {
    let raw: RawCard = serde_json::from_value(item).ok()?;
    let question = raw.question.trim().to_string();
    if question.is_empty() || raw.options.len() != Flashcard::OPTION_COUNT {
        return None;
    }

    let correct_index = resolve_index(raw.correct_index)?;
    Some(Flashcard {
        question,
        options: raw.options.into_iter().map(|o| o.trim().to_string()).collect(),
        correct_index,
        explanation: raw.explanation.trim().to_string(),
    })
}

/// Zero-based indices pass through. An index equal to the option count is
/// read as one-based and mapped to the last option; anything else is rejected.
fn resolve_index(index: i64) -> Option<usize> {
    let last = Flashcard::OPTION_COUNT - 1;
    match usize::try_from(index).ok()? {
        i if i <= last => Some(i),
        i if i == Flashcard::OPTION_COUNT => Some(last),
        _ => None,
    }
}

fn preview(raw: &str) -> String {
    raw.chars().take(120).collect()
}
