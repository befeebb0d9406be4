/// Configuration module for coderag.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::embedder::retry::RetryPolicy;
use crate::indexer::chunker::ChunkerConfig;

/// File name used when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "coderag.json";

// ── Default value functions ──────────────────────────────────────────

fn default_extensions() -> Vec<String> {
    vec!["py".to_string()]
}

fn default_exclude() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/venv/**".to_string(),
        "**/env/**".to_string(),
        "**/.venv/**".to_string(),
        "**/__pycache__/**".to_string(),
    ]
}

fn default_max_chunk_chars() -> usize {
    1000
}

fn default_max_workers() -> usize {
    4
}

fn default_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_dimensions() -> usize {
    768
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_top_k() -> usize {
    5
}

fn default_min_score() -> f32 {
    0.2
}

fn default_overfetch() -> usize {
    20
}

fn default_db_path() -> String {
    dirs::home_dir()
        .map(|home| home.join(".coderag").join("index.db"))
        .unwrap_or_else(|| PathBuf::from("./coderag.db"))
        .to_string_lossy()
        .into_owned()
}

fn default_keep_snapshots() -> usize {
    3
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Newest snapshots kept in the database; `0` disables persistence.
    #[serde(default = "default_keep_snapshots")]
    pub keep_snapshots: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexingConfig {
    /// File extensions (without dot) that are indexed.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Glob patterns, relative to the project root, that are never indexed.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    Http,
    Hashing,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

/// How overlapping hits are collapsed before truncating to `k`.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DedupPolicy {
    Off,
    /// Drop a hit nested inside a higher-scoring hit of the same file.
    #[default]
    Nesting,
    /// Drop a hit when at least `threshold` of its lines are covered by a
    /// higher-scoring hit of the same file.
    Overlap { threshold: f32 },
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Candidates fetched before thresholding and dedup.
    #[serde(default = "default_overfetch")]
    pub overfetch: usize,

    #[serde(default)]
    pub dedup: DedupPolicy,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            indexing: IndexingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            db_path: default_db_path(),
            keep_snapshots: default_keep_snapshots(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            exclude: default_exclude(),
            max_chunk_chars: default_max_chunk_chars(),
            max_workers: default_max_workers(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            endpoint: default_endpoint(),
            model: default_model(),
            dimensions: default_dimensions(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            overfetch: default_overfetch(),
            dedup: DedupPolicy::default(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to [`DEFAULT_CONFIG_FILE`].
    /// If the file does not exist, returns a default config and generates a
    /// template when the default path was used.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            DEFAULT_CONFIG_FILE
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == DEFAULT_CONFIG_FILE {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.indexing.extensions.is_empty(),
            "at least one indexing extension must be specified"
        );
        for pattern in &self.indexing.exclude {
            globset::Glob::new(pattern)
                .with_context(|| format!("invalid exclude pattern: {pattern}"))?;
        }
        anyhow::ensure!(
            self.indexing.max_chunk_chars > 0,
            "indexing.max_chunk_chars must be positive"
        );
        anyhow::ensure!(
            self.indexing.max_workers > 0,
            "indexing.max_workers must be positive"
        );
        anyhow::ensure!(
            self.embedding.dimensions > 0,
            "embedding.dimensions must be positive"
        );
        anyhow::ensure!(
            self.embedding.timeout_secs > 0,
            "embedding.timeout_secs must be positive"
        );
        anyhow::ensure!(self.retrieval.top_k > 0, "retrieval.top_k must be positive");
        anyhow::ensure!(
            (-1.0..=1.0).contains(&self.retrieval.min_score),
            "retrieval.min_score must be within [-1, 1]"
        );
        if let DedupPolicy::Overlap { threshold } = self.retrieval.dedup {
            anyhow::ensure!(
                threshold > 0.0 && threshold <= 1.0,
                "retrieval.dedup.threshold must be within (0, 1]"
            );
        }
        Ok(())
    }

    /// Retry policy for index-time embedding calls.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.embedding.max_retries,
            base_backoff: Duration::from_millis(self.embedding.backoff_ms),
            timeout: self.embedding_timeout(),
        }
    }

    #[must_use]
    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding.timeout_secs)
    }

    #[must_use]
    pub fn chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_chunk_chars: self.indexing.max_chunk_chars,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
