//! Service configuration stored in `mitosis.toml`, with environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::task::MAX_STEP_RETRIES;

pub const DEFAULT_CONFIG_FILE: &str = "mitosis.toml";

/// Service configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that
/// run locally with no external services except an optional Ollama.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MitosisConfig {
    /// Raises the default log level to `debug`.
    pub debug: bool,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub tools: ToolsConfig,
    pub cache: CacheConfig,
    pub events: EventsConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Directory of a static web UI served at `/`.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            static_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// MongoDB connection string. Unset means the in-memory store.
    pub mongo_url: Option<String>,
    pub database: String,
    /// JSON snapshot for the in-memory store.
    pub memory_db_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mongo_url: None,
            database: "mitosis".to_string(),
            memory_db_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    /// Ask the LLM for plans before falling back to the rule planner.
    pub plan_with_llm: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            model: "llama3.1:8b".to_string(),
            timeout_secs: 120,
            plan_with_llm: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_step_retries: u32,
    /// Pause before the worker re-invokes a failed step.
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_step_retries: MAX_STEP_RETRIES,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Upper bound on any single tool call.
    pub timeout_secs: u64,
    pub shell: ShellConfig,
    pub search: SearchConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            shell: ShellConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    pub enabled: bool,
    /// Program names (argv[0]) the shell tool may run.
    pub allowed_commands: Vec<String>,
    /// Truncate stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        let allowed = [
            "echo", "ls", "cat", "pwd", "date", "whoami", "uname", "df", "du", "wc", "head",
            "tail", "grep",
        ];
        Self {
            enabled: true,
            allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
    /// Instant-answer endpoint queried with `?q=...&format=json`.
    pub endpoint: String,
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.duckduckgo.com/".to_string(),
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    /// Age after which an entry is re-read from the store.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventsConfig {
    /// Per-connection queue; events beyond it are dropped for that connection.
    pub connection_buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            connection_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: u32,
    pub cleanup_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 30,
            cleanup_interval_secs: 60 * 60,
        }
    }
}

impl Default for MitosisConfig {
    fn default() -> Self {
        Self {
            debug: false,
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            tools: ToolsConfig::default(),
            cache: CacheConfig::default(),
            events: EventsConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl MitosisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_step_retries == 0 {
            return Err(anyhow!("retry.max_step_retries must be > 0"));
        }
        if self.tools.timeout_secs == 0 {
            return Err(anyhow!("tools.timeout_secs must be > 0"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs must be > 0"));
        }
        if self.cache.capacity == 0 {
            return Err(anyhow!("cache.capacity must be > 0"));
        }
        if self.events.connection_buffer == 0 {
            return Err(anyhow!("events.connection_buffer must be > 0"));
        }
        if self.retention.cleanup_interval_secs == 0 {
            return Err(anyhow!("retention.cleanup_interval_secs must be > 0"));
        }
        if self.tools.shell.enabled && self.tools.shell.allowed_commands.is_empty() {
            return Err(anyhow!(
                "tools.shell.allowed_commands must be non-empty when the shell tool is enabled"
            ));
        }
        if self.tools.shell.output_limit_bytes == 0 {
            return Err(anyhow!("tools.shell.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("MONGO_URL") {
            self.store.mongo_url = Some(url);
        }
        if let Some(db) = lookup("MONGO_DB") {
            self.store.database = db;
        }
        if let Some(url) = lookup("LLM_BASE_URL").or_else(|| lookup("OLLAMA_BASE_URL")) {
            self.llm.base_url = url;
        }
        if let Some(key) = lookup("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(path) = lookup("MEMORY_DB_PATH") {
            self.store.memory_db_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = lookup("DEBUG") {
            self.debug = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(raw) = lookup("MAX_STEP_RETRIES") {
            self.retry.max_step_retries = raw
                .trim()
                .parse()
                .with_context(|| format!("parse MAX_STEP_RETRIES '{raw}'"))?;
        }
        Ok(())
    }
}

/// Load config from a TOML file, then apply process environment overrides.
///
/// If the file is missing, starts from `MitosisConfig::default()`.
pub fn load_config(path: &Path) -> Result<MitosisConfig> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Like [`load_config`] with an explicit environment lookup.
pub fn load_config_with<F>(path: &Path, lookup: F) -> Result<MitosisConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        debug!(path = %path.display(), "config file missing, using defaults");
        MitosisConfig::default()
    };
    cfg.apply_env(lookup)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MitosisConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
