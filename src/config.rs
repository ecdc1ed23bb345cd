//! Runtime configuration for clauseret.
//!
//! Settings are layered: built-in defaults, then a TOML file, then
//! environment variables, then command-line flags (applied by the CLI).
//! The file lives at `~/.config/clauseret/config.toml` (or XDG equivalent)
//! unless `--config` points elsewhere.
//!
//! # Example Configuration
//!
//! ```toml
//! workers = 8
//! timeout_secs = 120
//! fields = ["title", "article"]
//!
//! [cache]
//! dir = "/var/cache/clauseret"
//! max_entries = 50000
//!
//! [learned]
//! model_dir = "/opt/models/all-MiniLM-L6-v2"
//! reranker_dir = "/opt/models/ms-marco-MiniLM-L-6-v2"
//! candidate_pool = 100
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name used for config and cache directories.
pub const APP_DIR: &str = "clauseret";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CLAUSERET_";

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {value}")]
    Env { var: String, value: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Worker threads for batch runs. `None` means available parallelism.
    pub workers: Option<usize>,
    /// Per-task wall-clock deadline in seconds.
    pub timeout_secs: f64,
    /// Result count used when a batch does not specify one.
    pub default_k: usize,
    /// Document fields whose text is searched.
    pub fields: Vec<String>,
    /// Field holding the clause text in clause files.
    pub clause_field: String,
    pub cache: CacheConfig,
    pub lexical: LexicalConfig,
    pub learned: LearnedConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            workers: None,
            timeout_secs: 300.0,
            default_k: 5,
            fields: vec!["text".to_string()],
            clause_field: "Clause".to_string(),
            cache: CacheConfig::default(),
            lexical: LexicalConfig::default(),
            learned: LearnedConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disable to always invoke backends.
    pub enabled: bool,
    /// Cache root. Defaults to the platform cache dir.
    pub dir: Option<PathBuf>,
    /// Upper bound on entries per corpus namespace. `None` keeps everything.
    pub max_entries: Option<usize>,
    /// Size of the in-process LRU in front of the disk store.
    pub memory_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_entries: None,
            memory_entries: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LexicalConfig {
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self {
            bm25_k1: 1.2,
            bm25_b: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnedConfig {
    /// ONNX sentence encoder bundle used by `encoder` and `embedding`.
    pub model_dir: Option<PathBuf>,
    /// DPR question encoder bundle.
    pub query_model_dir: Option<PathBuf>,
    /// DPR context encoder bundle.
    pub context_model_dir: Option<PathBuf>,
    /// ONNX cross-encoder bundle used by `cross_encoder`.
    pub reranker_dir: Option<PathBuf>,
    /// Output dimension of the hashing encoder used when no model is configured.
    pub hash_dimension: usize,
    /// Lexical candidates handed to re-scoring methods.
    pub candidate_pool: usize,
}

impl Default for LearnedConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            query_model_dir: None,
            context_model_dir: None,
            reranker_dir: None,
            hash_dimension: 256,
            candidate_pool: 100,
        }
    }
}

impl RetrievalConfig {
    /// Load from an explicit file, or the default location when `path` is `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    /// Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => match Self::config_path() {
                Some(default) if default.exists() => Self::load_from(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a specific TOML file without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    ///
    /// Respects `$XDG_CONFIG_HOME` first, then the platform config dir.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg_config).join(APP_DIR).join("config.toml"));
        }
        dirs::config_dir().map(|p| p.join(APP_DIR).join("config.toml"))
    }

    /// Apply `CLAUSERET_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(dir) = env_var("CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = env_var("TIMEOUT_SECS") {
            self.timeout_secs = parse_env("TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = env_var("WORKERS") {
            self.workers = Some(parse_env("WORKERS", &value)?);
        }
        if let Some(value) = env_var("MAX_CACHE_ENTRIES") {
            self.cache.max_entries = Some(parse_env("MAX_CACHE_ENTRIES", &value)?);
        }
        if let Some(dir) = env_var("MODEL_DIR") {
            self.learned.model_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs <= 0.0 || Duration::try_from_secs_f64(self.timeout_secs).is_err() {
            return Err(ConfigError::Validation(format!(
                "timeout_secs must be a positive number of seconds, got {}",
                self.timeout_secs
            )));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Validation("workers must be at least 1".into()));
        }
        if self.default_k == 0 {
            return Err(ConfigError::Validation("default_k must be at least 1".into()));
        }
        if self.fields.is_empty() || self.fields.iter().any(|f| f.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "fields must name at least one non-empty document field".into(),
            ));
        }
        if self.cache.max_entries == Some(0) {
            return Err(ConfigError::Validation(
                "cache.max_entries must be at least 1 (omit it for no bound)".into(),
            ));
        }
        if self.learned.hash_dimension == 0 {
            return Err(ConfigError::Validation(
                "learned.hash_dimension must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Per-task deadline.
    pub fn task_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
    }

    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Resolved cache root.
    ///
    /// Falls back to `./retrieval_cache` when the platform has no cache dir.
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache.dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .map(|p| p.join(APP_DIR).join("retrieval_cache"))
            .unwrap_or_else(|| PathBuf::from("retrieval_cache"))
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(suffix: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var: format!("{ENV_PREFIX}{suffix}"),
        value: value.to_string(),
    })
}
