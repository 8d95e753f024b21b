//! Core pipeline orchestration and domain logic for StudyDeck.
//!
//! This crate ties together extraction, chunking, the task registry, and the
//! generation service into the three study operations: summarize, flashcards,
//! and report.

pub mod bridge;
pub mod estimator;
pub mod flashcards;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod service;

#[cfg(test)]
mod mock;

pub use bridge::BridgeService;
pub use estimator::Estimator;
pub use pipeline::{
    Orchestrator, PreparedContent, ProgressReporter, SilentProgress, report_fingerprint,
};
pub use registry::{CancelHook, CreateOutcome, Task, TaskRegistry};
pub use service::{Availability, Capability, GenerationService, GenerationSession, SessionSpec};
