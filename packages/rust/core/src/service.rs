//! Capability interface to the external text-generation service.
//!
//! The pipeline only sees these traits. [`crate::bridge::BridgeService`] is the
//! subprocess implementation; tests use an in-crate mock.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use studydeck_shared::{Result, SummaryOptions};

/// A generation capability the service may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Dedicated summarization model.
    Summarizer,
    /// Free-form prompting constrained by a JSON schema.
    Structured,
    /// Free-form text prompting.
    Text,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarizer => "summarizer",
            Self::Structured => "structured",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Ready,
    /// Usable once the model finishes downloading; the first call may be slow.
    NeedsDownload,
    Unsupported,
}

/// What kind of session to open.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSpec {
    Summarizer(SummaryOptions),
    Structured { schema: serde_json::Value },
    Text,
}

impl SessionSpec {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Summarizer(_) => Capability::Summarizer,
            Self::Structured { .. } => Capability::Structured,
            Self::Text => Capability::Text,
        }
    }
}

/// An open model session. Sessions hold service-side resources until
/// [`GenerationSession::destroy`] is called.
#[async_trait]
pub trait GenerationSession: Send + Sync {
    /// Run one prompt (or one text to summarize) to completion.
    async fn run(&self, input: &str, cancel: &CancellationToken) -> Result<String>;

    /// Run with incremental output. Every value sent is the full best-effort
    /// text so far; receivers keep only the latest.
    async fn run_streaming(
        &self,
        input: &str,
        cancel: &CancellationToken,
        snapshots: &watch::Sender<String>,
    ) -> Result<String> {
        let text = self.run(input, cancel).await?;
        snapshots.send_replace(text.clone());
        Ok(text)
    }

    /// Release the session. Safe to call more than once.
    fn destroy(&self);
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn availability(&self, capability: Capability) -> Result<Availability>;

    async fn open_session(&self, spec: SessionSpec) -> Result<Arc<dyn GenerationSession>>;
}
