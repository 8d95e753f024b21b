//! Error types for StudyDeck.
//!
//! Library crates use [`StudyDeckError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all StudyDeck operations.
#[derive(Debug, thiserror::Error)]
pub enum StudyDeckError {
    /// Extraction produced too little text to work with.
    #[error("content too short: {chars} characters (minimum {min})")]
    ContentTooShort { chars: usize, min: usize },

    /// A generation capability is absent or unsupported on this device.
    #[error("generation service unavailable ({capability}): {reason}")]
    ServiceUnavailable { capability: String, reason: String },

    /// Structured output could not be parsed, even after the fallback pass.
    #[error("generation format error: {message}")]
    GenerationFormat { message: String },

    /// The task reached `Cancelled` on purpose. Not a failure.
    #[error("task cancelled")]
    Cancelled,

    /// Caller supplied unusable input (e.g. no report sources).
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// An equivalent task is already pending or running.
    #[error("duplicate task: {task_id} is already in progress")]
    DuplicateTask { task_id: String },

    /// A call into the generation service failed.
    #[error("generation error: {0}")]
    Generation(String),

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StudyDeckError>;

impl StudyDeckError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create an invalid-input error from any displayable message.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: msg.into(),
        }
    }

    /// Create a generation-format error from any displayable message.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::GenerationFormat {
            message: msg.into(),
        }
    }

    /// Create a service-unavailable error for a named capability.
    pub fn unavailable(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            capability: capability.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error represents an intentional cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A short, human-readable reason suitable for showing to an end user.
    ///
    /// Never includes paths, debug dumps, or nested source errors.
    pub fn user_message(&self) -> String {
        match self {
            Self::ContentTooShort { min, .. } => format!(
                "Not enough text to work with. Select at least {min} characters of content."
            ),
            Self::ServiceUnavailable { capability, .. } => format!(
                "The on-device {capability} is not available on this device."
            ),
            Self::GenerationFormat { .. } => {
                "The model returned a response that could not be understood. Try again.".into()
            }
            Self::Cancelled => "The task was cancelled.".into(),
            Self::InvalidInput { message } => format!("Invalid input: {message}."),
            Self::DuplicateTask { .. } => {
                "This content is already being processed.".into()
            }
            Self::Generation(_) => "Text generation failed. Try again later.".into(),
            Self::Parse { .. } => "The page content could not be read.".into(),
            Self::Config { .. } => "The configuration file could not be used.".into(),
            Self::Storage(_) | Self::Io { .. } | Self::Serialization(_) => {
                "Local storage could not be accessed.".into()
            }
        }
    }
}

impl From<serde_json::Error> for StudyDeckError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
