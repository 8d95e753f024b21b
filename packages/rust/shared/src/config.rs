//! Application configuration for StudyDeck.
//!
//! User config lives at `~/.studydeck/studydeck.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StudyDeckError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "studydeck.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".studydeck";

/// Default database file name inside the config directory.
const DB_FILE_NAME: &str = "studydeck.db";

// ---------------------------------------------------------------------------
// Config structs (matching studydeck.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Chunking limits.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Orchestration thresholds.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Duration estimator tuning.
    #[serde(default)]
    pub estimator: EstimatorConfig,

    /// Task registry retention.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Generation service bridge.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Local database.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[chunking]` section. All sizes are in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Largest chunk handed to the generation service.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// A trailing chunk smaller than this is folded into its predecessor.
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Tail of the previous chunk copied to the start of the next one.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            min_size: default_min_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_max_size() -> usize {
    10_000
}
fn default_min_size() -> usize {
    500
}
fn default_overlap() -> usize {
    200
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Joined chunk summaries up to this size get a final "summary of summaries" pass.
    #[serde(default = "default_combine_limit")]
    pub summary_combine_limit: usize,

    /// Report sources longer than this are pre-summarized.
    #[serde(default = "default_report_source_limit")]
    pub report_source_limit: usize,

    /// Consume summaries through the streaming capability.
    #[serde(default)]
    pub stream_summaries: bool,

    /// Flashcard count when the caller does not ask for one.
    #[serde(default = "default_flashcard_count")]
    pub default_flashcard_count: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            summary_combine_limit: default_combine_limit(),
            report_source_limit: default_report_source_limit(),
            stream_summaries: false,
            default_flashcard_count: default_flashcard_count(),
        }
    }
}

fn default_combine_limit() -> usize {
    10_000
}
fn default_report_source_limit() -> usize {
    6_000
}
fn default_flashcard_count() -> usize {
    10
}

/// `[estimator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Records required before history replaces the baselines.
    #[serde(default = "default_min_records")]
    pub min_records: usize,

    /// How many recent records feed the average.
    #[serde(default = "default_window")]
    pub window: usize,

    /// Records kept per operation type.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// Records older than this are purged.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,

    /// Fixed per-task overhead in seconds.
    #[serde(default = "default_overhead_secs")]
    pub overhead_secs: f64,

    /// Lower bound for any estimate, in seconds.
    #[serde(default = "default_min_estimate_secs")]
    pub min_estimate_secs: f64,

    /// Baseline seconds per unit used before enough history exists.
    #[serde(default)]
    pub baselines: BaselineConfig,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_records: default_min_records(),
            window: default_window(),
            history_cap: default_history_cap(),
            max_age_days: default_max_age_days(),
            overhead_secs: default_overhead_secs(),
            min_estimate_secs: default_min_estimate_secs(),
            baselines: BaselineConfig::default(),
        }
    }
}

fn default_min_records() -> usize {
    3
}
fn default_window() -> usize {
    10
}
fn default_history_cap() -> usize {
    50
}
fn default_max_age_days() -> i64 {
    30
}
fn default_overhead_secs() -> f64 {
    2.0
}
fn default_min_estimate_secs() -> f64 {
    2.0
}

/// `[estimator.baselines]`: seconds per unit for each operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineConfig {
    #[serde(default = "default_summarize_baseline")]
    pub summarize: f64,
    #[serde(default = "default_flashcards_baseline")]
    pub flashcards: f64,
    #[serde(default = "default_report_baseline")]
    pub report: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            summarize: default_summarize_baseline(),
            flashcards: default_flashcards_baseline(),
            report: default_report_baseline(),
        }
    }
}

fn default_summarize_baseline() -> f64 {
    4.0
}
fn default_flashcards_baseline() -> f64 {
    6.0
}
fn default_report_baseline() -> f64 {
    8.0
}

/// `[registry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How long a finished task stays queryable.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// How often the background sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_retention_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    60
}

/// `[service]` section: the local process that hosts the on-device model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Executable speaking the JSON-lines bridge protocol.
    #[serde(default = "default_service_command")]
    pub command: String,

    /// Extra arguments for the executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the bridge process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command: default_service_command(),
            args: Vec::new(),
            working_dir: None,
        }
    }
}

fn default_service_command() -> String {
    "studydeck-bridge".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path. Defaults to `~/.studydeck/studydeck.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.studydeck/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| StudyDeckError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.studydeck/studydeck.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the database path from config, falling back to the config directory.
pub fn resolve_db_path(config: &AppConfig) -> Result<PathBuf> {
    match &config.storage.db_path {
        Some(p) => Ok(PathBuf::from(p)),
        None => Ok(config_dir()?.join(DB_FILE_NAME)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| StudyDeckError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        StudyDeckError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject configurations that would make chunking or estimation meaningless.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let c = &config.chunking;
    if c.max_size == 0 {
        return Err(StudyDeckError::config("chunking.max_size must be positive"));
    }
    if c.overlap >= c.max_size {
        return Err(StudyDeckError::config(format!(
            "chunking.overlap ({}) must be smaller than chunking.max_size ({})",
            c.overlap, c.max_size
        )));
    }
    if config.estimator.window == 0 || config.estimator.history_cap == 0 {
        return Err(StudyDeckError::config(
            "estimator.window and estimator.history_cap must be positive",
        ));
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| StudyDeckError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| StudyDeckError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| StudyDeckError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_size"));
        assert!(toml_str.contains("studydeck-bridge"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.chunking.max_size, 10_000);
        assert_eq!(parsed.chunking.overlap, 200);
        assert_eq!(parsed.registry.retention_secs, 300);
        assert_eq!(parsed.estimator.history_cap, 50);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[chunking]
max_size = 4000

[service]
command = "node"
args = ["bridge.js"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.chunking.max_size, 4000);
        assert_eq!(config.chunking.min_size, 500);
        assert_eq!(config.service.args, vec!["bridge.js".to_string()]);
        assert_eq!(config.estimator.baselines.flashcards, 6.0);
    }

    #[test]
    fn overlap_must_be_smaller_than_max() {
        let mut config = AppConfig::default();
        config.chunking.overlap = config.chunking.max_size;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn explicit_db_path_wins() {
        let mut config = AppConfig::default();
        config.storage.db_path = Some("/tmp/sd.db".into());
        assert_eq!(resolve_db_path(&config).unwrap(), PathBuf::from("/tmp/sd.db"));
    }
}
