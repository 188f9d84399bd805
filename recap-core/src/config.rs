//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/recap/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/recap/` (~/.config/recap/)
//! - Data: `$XDG_DATA_HOME/recap/` (~/.local/share/recap/)
//! - State/Logs: `$XDG_STATE_HOME/recap/` (~/.local/state/recap/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Inference backend configuration
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Analysis and job execution configuration
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Session log discovery configuration
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inference backend configuration
#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    /// Backend base URL
    #[serde(default = "default_inference_url")]
    pub url: String,

    /// Default model for analysis
    #[serde(default = "default_model")]
    pub model: String,

    /// Default context window size (num_ctx)
    #[serde(default = "default_context_size")]
    pub context_size: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for linear retry backoff, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: default_inference_url(),
            model: default_model(),
            context_size: default_context_size(),
            timeout_secs: default_inference_timeout(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl InferenceConfig {
    /// Per-request timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Base retry delay as a [`Duration`]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

fn default_inference_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "qwen2.5:72b".to_string()
}

fn default_context_size() -> u32 {
    32768
}

fn default_inference_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

/// Analysis and job execution configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Target tokens per chunk for map-reduce analysis
    #[serde(default = "default_chunk_tokens")]
    pub chunk_tokens: usize,

    /// Number of turns to overlap between chunks
    #[serde(default = "default_overlap_turns")]
    pub overlap_turns: usize,

    /// Worker pool size for background jobs
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Days to keep analysis results before the retention sweep removes them
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: default_chunk_tokens(),
            overlap_turns: default_overlap_turns(),
            workers: default_workers(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_chunk_tokens() -> usize {
    crate::chunker::DEFAULT_CHUNK_TOKENS
}

fn default_overlap_turns() -> usize {
    crate::chunker::DEFAULT_OVERLAP_TURNS
}

fn default_workers() -> usize {
    2
}

fn default_retention_days() -> u32 {
    30
}

/// Session log discovery configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SessionsConfig {
    /// Override for the session log directory (default: ~/.claude/projects)
    pub dir: Option<PathBuf>,
}

impl SessionsConfig {
    /// Resolved session log directory
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            crate::transcript::default_sessions_dir()
                .unwrap_or_else(|| PathBuf::from(".claude/projects"))
        })
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/recap/config.toml` (~/.config/recap/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("recap").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite database)
    ///
    /// `$XDG_DATA_HOME/recap/` (~/.local/share/recap/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("recap")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/recap/` (~/.local/state/recap/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("recap")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/recap/jobs.db` (~/.local/share/recap/jobs.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("jobs.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/recap/recap.log` (~/.local/state/recap/recap.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("recap.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path
    /// behavior before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
