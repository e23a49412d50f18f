//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (GRAPHLOOM_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [storage]
//! data_dir = "/var/lib/graphloom/data"
//! default_database = "graph"
//!
//! [pipeline]
//! max_concurrent_tasks = 3
//! enable_smart_merge = true
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! GRAPHLOOM_STORAGE__DATA_DIR=/custom/path
//! GRAPHLOOM_PIPELINE__MAX_CONCURRENT_TASKS=8
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// File extension for graph database snapshots
pub const DATABASE_EXTENSION: &str = "kg";

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Snapshot storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all database snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Default database name (used by auto-save and default load)
    #[serde(default = "default_database")]
    pub default_database: String,
}

/// Task pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of extract workers
    #[serde(default = "default_extract_workers")]
    pub max_concurrent_tasks: usize,

    /// If false, merges are identity passes (no completion-service consult)
    #[serde(default = "default_true")]
    pub enable_smart_merge: bool,

    /// Snapshot the graph after each completed merge
    #[serde(default = "default_true")]
    pub auto_save_enabled: bool,

    /// Reject submits once this many tasks are pending or running (0 = unbounded)
    #[serde(default)]
    pub max_pending_tasks: usize,
}

/// Extraction reply parsing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Field separator inside a record
    #[serde(default = "default_tuple_delimiter")]
    pub tuple_delimiter: String,

    /// Separator between records
    #[serde(default = "default_record_delimiter")]
    pub record_delimiter: String,

    /// Marker terminating the reply
    #[serde(default = "default_completion_delimiter")]
    pub completion_delimiter: String,

    /// Output language instruction for the completion service
    #[serde(default = "default_language")]
    pub language: String,

    /// Run the second "check/optimize" pass over the extraction reply
    #[serde(default = "default_true")]
    pub enable_check: bool,
}

/// Completion-service client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// OpenAI-compatible API base URL
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,

    /// Model identifier sent with each request
    #[serde(default = "default_completion_model")]
    pub model: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Sampling temperature for the main extraction call
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

/// Prompt template locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    /// Directory holding the prompt template files
    #[serde(default = "default_prompts_dir")]
    pub dir: PathBuf,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address for the REST API
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Route DEBUG output to rolling log files
    #[serde(default)]
    pub verbose: bool,

    /// Directory for log files when verbose is enabled
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_database() -> String {
    "graph".to_string()
}
fn default_extract_workers() -> usize {
    3
}
fn default_true() -> bool {
    true
}
fn default_tuple_delimiter() -> String {
    "|".to_string()
}
fn default_record_delimiter() -> String {
    "^".to_string()
}
fn default_completion_delimiter() -> String {
    "DONE".to_string()
}
fn default_language() -> String {
    "English".to_string()
}
fn default_completion_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "GRAPHLOOM_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_prompts_dir() -> PathBuf {
    PathBuf::from("./prompts")
}
fn default_listen_addr() -> String {
    "127.0.0.1:8640".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (GRAPHLOOM_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("GRAPHLOOM_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("GRAPHLOOM_").split("__"))
            .extract()
    }

    /// Path of the default database snapshot
    pub fn default_database_path(&self) -> PathBuf {
        self.storage
            .data_dir
            .join(&self.storage.default_database)
            .with_extension(DATABASE_EXTENSION)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: default_data_dir(),
            default_database: default_database(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_concurrent_tasks: default_extract_workers(),
            enable_smart_merge: true,
            auto_save_enabled: true,
            max_pending_tasks: 0,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            tuple_delimiter: default_tuple_delimiter(),
            record_delimiter: default_record_delimiter(),
            completion_delimiter: default_completion_delimiter(),
            language: default_language(),
            enable_check: true,
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        CompletionConfig {
            base_url: default_completion_base_url(),
            model: default_completion_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
        }
    }
}

impl Default for PromptsConfig {
    fn default() -> Self {
        PromptsConfig {
            dir: default_prompts_dir(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            verbose: false,
            dir: default_log_dir(),
        }
    }
}
