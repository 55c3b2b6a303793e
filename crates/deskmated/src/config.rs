//! Configuration management for deskmated.
//!
//! Loads settings from `$DESKMATE_CONFIG`, then /etc/deskmate/config.toml,
//! then falls back to defaults. Every field has its own default so partial
//! files are fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/deskmate/config.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "DESKMATE_CONFIG";

/// API key values that ship in sample .env files and mean "unset"
const PLACEHOLDER_KEYS: &[&str] = &[
    "your_openai_api_key_here",
    "your_anthropic_api_key_here",
    "your_api_key_here",
    "changeme",
    "sk-...",
];

/// Pipeline tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Turns of history the normalizer looks at
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Below this many tokens an uncategorized message gets a clarifying question
    #[serde(default = "default_min_query_tokens")]
    pub min_query_tokens: usize,

    #[serde(default = "default_max_causes")]
    pub max_causes: usize,

    #[serde(default = "default_min_steps")]
    pub min_steps: usize,

    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Causes within this much of the top confidence get their remedies combined
    #[serde(default = "default_close_confidence_delta")]
    pub close_confidence_delta: f32,

    /// Multiplier applied to causes whose remedies were already tried
    #[serde(default = "default_attempted_penalty")]
    pub attempted_penalty: f32,

    /// Confidence ceiling when no passage backs the diagnosis
    #[serde(default = "default_no_knowledge_cap")]
    pub no_knowledge_confidence_cap: f32,
}

fn default_history_window() -> usize {
    6
}

fn default_min_query_tokens() -> usize {
    3
}

fn default_max_causes() -> usize {
    3
}

fn default_min_steps() -> usize {
    3
}

fn default_max_steps() -> usize {
    8
}

fn default_close_confidence_delta() -> f32 {
    0.1
}

fn default_attempted_penalty() -> f32 {
    0.5
}

fn default_no_knowledge_cap() -> f32 {
    0.6
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            min_query_tokens: default_min_query_tokens(),
            max_causes: default_max_causes(),
            min_steps: default_min_steps(),
            max_steps: default_max_steps(),
            close_confidence_delta: default_close_confidence_delta(),
            attempted_penalty: default_attempted_penalty(),
            no_knowledge_confidence_cap: default_no_knowledge_cap(),
        }
    }
}

/// Which embedder backs the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    /// Offline feature hashing, deterministic
    #[default]
    Hashing,
    /// Ollama /api/embed
    Ollama,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Nearest neighbours fetched before ranking
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum cosine similarity kept by the ranker
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Maximum passages handed to the analyzer
    #[serde(default = "default_result_cap")]
    pub result_cap: usize,

    #[serde(default = "default_index_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub embedder: EmbedderKind,

    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// External knowledge pack (JSON); the built-in pack is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_path: Option<PathBuf>,
}

fn default_top_k() -> usize {
    10
}

fn default_similarity_threshold() -> f32 {
    // Feature-hashing similarities run lower than neural embeddings.
    0.35
}

fn default_result_cap() -> usize {
    5
}

fn default_index_timeout_ms() -> u64 {
    3_000
}

fn default_ollama_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            result_cap: default_result_cap(),
            timeout_ms: default_index_timeout_ms(),
            embedder: EmbedderKind::default(),
            ollama_url: default_ollama_url(),
            embedding_model: default_embedding_model(),
            knowledge_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Ollama /api/generate
    #[default]
    Ollama,
    /// OpenAI-compatible /v1/chat/completions
    Openai,
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Disabled by default: rule-based mode needs no network
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub provider: LlmProvider,

    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_llm_model() -> String {
    "qwen2.5:7b-instruct".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_llm_timeout() -> u64 {
    8
}

fn default_max_tokens() -> u32 {
    1200
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: LlmProvider::default(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_llm_timeout(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmConfig {
    /// API key from the configured environment variable, ignoring placeholders.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| is_real_api_key(k))
    }

    /// Whether a backend can be built from this config. Ollama needs no key;
    /// OpenAI-compatible providers do.
    pub fn is_usable(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.provider {
            LlmProvider::Ollama => true,
            LlmProvider::Openai => self.api_key().is_some(),
        }
    }
}

/// Reject empty and sample-file keys.
pub fn is_real_api_key(value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() {
        return false;
    }
    let lowered = v.to_lowercase();
    if PLACEHOLDER_KEYS.contains(&lowered.as_str()) {
        return false;
    }
    if lowered.starts_with("sk-") && v.len() > 8 {
        return true;
    }
    v.len() >= 20 && !v.contains(' ') && !lowered.contains("_key_here")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from the env override or system path, or return defaults
    pub fn load() -> Self {
        Self::try_load().unwrap_or_else(|e| {
            warn!("Config not loaded, using defaults: {:#}", e);
            Config::default()
        })
    }

    /// Config from `$DESKMATE_CONFIG` or the system path.
    pub fn try_load() -> Result<Self> {
        Self::load_from_env_path(std::env::var(CONFIG_ENV).ok())
    }

    /// An explicit path must load. A missing system file means defaults.
    fn load_from_env_path(env_path: Option<String>) -> Result<Self> {
        match env_path {
            Some(path) => Self::load_from_path(path),
            None if Path::new(CONFIG_PATH).exists() => Self::load_from_path(CONFIG_PATH),
            None => Ok(Config::default()),
        }
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Catch settings that would break pipeline invariants.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.min_steps == 0 || p.min_steps > p.max_steps {
            anyhow::bail!(
                "pipeline.min_steps ({}) must be in 1..=max_steps ({})",
                p.min_steps,
                p.max_steps
            );
        }
        if p.max_causes == 0 {
            anyhow::bail!("pipeline.max_causes must be at least 1");
        }
        if !(0.0..=1.0).contains(&p.attempted_penalty) {
            anyhow::bail!("pipeline.attempted_penalty must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            anyhow::bail!("retrieval.similarity_threshold must be within 0..=1");
        }
        if self.retrieval.result_cap == 0 {
            anyhow::bail!("retrieval.result_cap must be at least 1");
        }
        Ok(())
    }

    /// Default config rendered as TOML, for `deskmated config`.
    pub fn default_toml() -> Result<String> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}
