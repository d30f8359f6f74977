//! Configuration management for deckflow
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Queue polling and lease configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Backoff policy for external calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Chunking configuration
    #[serde(default)]
    pub chunk: ChunkConfig,

    /// Image deduplication configuration
    #[serde(default)]
    pub dedupe: DedupeConfig,

    /// Page rendering configuration
    #[serde(default)]
    pub render: RenderConfig,

    /// Vision/LLM service configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Blob storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Sleep between polls of an empty topic (milliseconds)
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a received message stays invisible to other consumers
    #[serde(default = "default_queue_lease_secs")]
    pub lease_secs: u64,

    /// Deliveries after which a message goes straight to the dead-letter topic
    #[serde(default = "default_queue_max_deliveries")]
    pub max_deliveries: u32,

    /// Messages pulled per receive call
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the second attempt (milliseconds)
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for the doubled delay (milliseconds)
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Total attempts, including the first
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Maximum tokens per chunk
    #[serde(default = "default_chunk_max_tokens")]
    pub max_tokens: usize,

    /// Overlap tokens between consecutive chunks
    #[serde(default = "default_chunk_overlap_tokens")]
    pub overlap_tokens: usize,
}

/// Image deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeConfig {
    /// Edge length of the downscaled grayscale grid
    #[serde(default = "default_dedupe_hash_size")]
    pub hash_size: u32,

    /// Maximum Hamming distance at which two hashes count as the same image
    #[serde(default = "default_dedupe_max_distance")]
    pub max_distance: u32,
}

/// Page rendering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Target width of the full-page raster
    #[serde(default = "default_render_width")]
    pub width: u32,
}

/// Vision/LLM service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the model sidecar
    #[serde(default = "default_llm_url")]
    pub url: String,

    /// Model used to classify and transcribe images
    #[serde(default = "default_image_analysis_model")]
    pub image_analysis_model: String,

    /// Model used to explain slides
    #[serde(default = "default_explanation_model")]
    pub explanation_model: String,

    /// Model used to synthesize the lecture summary
    #[serde(default = "default_summary_model")]
    pub summary_model: String,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Requests per second across all model calls of one process
    #[serde(default = "default_llm_requests_per_second")]
    pub requests_per_second: u32,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding backend
    #[serde(default = "default_embedding_url")]
    pub url: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension (must match model)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Batch size for embedding requests
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

/// Blob storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Blob root; relative paths resolve against the base directory
    #[serde(default = "default_storage_dir")]
    pub root: String,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for deckflow data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_queue_poll_interval_ms(),
            lease_secs: default_queue_lease_secs(),
            max_deliveries: default_queue_max_deliveries(),
            batch_size: default_queue_batch_size(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_retry_initial_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_max_tokens(),
            overlap_tokens: default_chunk_overlap_tokens(),
        }
    }
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            hash_size: default_dedupe_hash_size(),
            max_distance: default_dedupe_max_distance(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: default_render_width(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            image_analysis_model: default_image_analysis_model(),
            explanation_model: default_explanation_model(),
            summary_model: default_summary_model(),
            timeout_secs: default_llm_timeout(),
            requests_per_second: default_llm_requests_per_second(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_dir(),
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl RetryConfig {
    /// Build the backoff policy shared by every worker
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

impl Config {
    /// Get the default base directory for deckflow (~/.deckflow)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".deckflow")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: base.join("deckflow.db"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Set up paths based on config file location
        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: base.join("deckflow.db"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Check if deckflow is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Resolved blob store root
    pub fn storage_root(&self) -> PathBuf {
        let root = PathBuf::from(&self.storage.root);
        if root.is_absolute() {
            root
        } else {
            self.paths.base_dir.join(root)
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk.max_tokens == 0 {
            return Err(Error::Config("chunk.max_tokens must be positive".to_string()));
        }

        if self.chunk.overlap_tokens >= self.chunk.max_tokens {
            return Err(Error::Config(
                "chunk.overlap_tokens must be < chunk.max_tokens".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(Error::Config(
                "retry.max_delay_ms must be >= retry.initial_delay_ms".to_string(),
            ));
        }

        if self.queue.lease_secs == 0 {
            return Err(Error::Config("queue.lease_secs must be positive".to_string()));
        }

        if self.queue.max_deliveries == 0 || self.queue.batch_size == 0 {
            return Err(Error::Config(
                "queue.max_deliveries and queue.batch_size must be positive".to_string(),
            ));
        }

        if self.llm.requests_per_second == 0 {
            return Err(Error::Config(
                "llm.requests_per_second must be positive".to_string(),
            ));
        }

        if !(2..=16).contains(&self.dedupe.hash_size) {
            return Err(Error::Config(
                "dedupe.hash_size must be between 2 and 16".to_string(),
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(Error::Config(
                "embedding.batch_size must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
