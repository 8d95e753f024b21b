//! Shared types, error model, and configuration for StudyDeck.
//!
//! This crate is the foundation depended on by all other StudyDeck crates.
//! It provides:
//! - [`StudyDeckError`]: the unified error type
//! - Domain types ([`TaskId`], [`OperationType`], [`TaskResult`], [`TimingRecord`], ...)
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BaselineConfig, ChunkingConfig, EstimatorConfig, PipelineConfig, RegistryConfig,
    ServiceConfig, StorageConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, resolve_db_path, validate_config,
};
pub use error::{Result, StudyDeckError};
pub use types::{
    CombineStrategy, ContentFingerprint, Flashcard, FlashcardSet, OperationType, ReportResult,
    ReportSource, SummaryFormat, SummaryLength, SummaryOptions, SummaryResult, SummaryType,
    TaskId, TaskResult, TaskStatus, TimingRecord,
};
