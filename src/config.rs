//! TOML configuration parsing.
//!
//! Every section except `[server]` is optional and falls back to defaults,
//! so a minimal `deck.toml` only needs:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:7340"
//! ```
//!
//! Secrets are never stored in the file; `[llm].api_key_env` names the
//! environment variable that holds the API key.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub compile: CompileConfig,
    #[serde(default)]
    pub render: RenderConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_research_max_tokens")]
    pub research_max_tokens: u32,
    #[serde(default = "default_outline_max_tokens")]
    pub outline_max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            research_max_tokens: default_research_max_tokens(),
            outline_max_tokens: default_outline_max_tokens(),
            temperature: None,
            streaming: true,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_research_max_tokens() -> u32 {
    4000
}
fn default_outline_max_tokens() -> u32 {
    3000
}
fn default_true() -> bool {
    true
}
fn default_llm_timeout_secs() -> u64 {
    300
}

/// External statistical runtime (`Rscript`) settings.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_rscript")]
    pub command: PathBuf,
    #[serde(default = "default_runtime_timeout_secs")]
    pub timeout_secs: u64,
    /// Parent directory for per-execution scratch directories.
    /// Defaults to the system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default = "default_plot_width")]
    pub plot_width_in: f32,
    #[serde(default = "default_plot_height")]
    pub plot_height_in: f32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_rscript(),
            timeout_secs: default_runtime_timeout_secs(),
            scratch_dir: None,
            plot_width_in: default_plot_width(),
            plot_height_in: default_plot_height(),
        }
    }
}

fn default_rscript() -> PathBuf {
    PathBuf::from("Rscript")
}
fn default_runtime_timeout_secs() -> u64 {
    30
}
fn default_plot_width() -> f32 {
    8.0
}
fn default_plot_height() -> f32 {
    5.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    /// Entries older than this are treated as missing. `None` keeps them
    /// until evicted.
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            max_age_secs: None,
        }
    }
}

fn default_max_size_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompileConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Default template name when the caller does not pick one.
    #[serde(default = "default_template")]
    pub default_template: String,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            default_template: default_template(),
        }
    }
}

fn default_max_parallel() -> usize {
    4
}
fn default_template() -> String {
    "classic".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    /// `"marp"` shells out to marp-cli, `"passthrough"` returns the
    /// assembled markdown unchanged.
    #[serde(default = "default_renderer")]
    pub renderer: String,
    #[serde(default = "default_marp")]
    pub command: PathBuf,
    #[serde(default = "default_render_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            renderer: default_renderer(),
            command: default_marp(),
            timeout_secs: default_render_timeout_secs(),
        }
    }
}

fn default_renderer() -> String {
    "passthrough".to_string()
}
fn default_marp() -> PathBuf {
    PathBuf::from("marp")
}
fn default_render_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Config {
    /// A config with every section defaulted, bound to localhost.
    pub fn minimal() -> Self {
        Self {
            llm: LlmConfig::default(),
            runtime: RuntimeConfig::default(),
            cache: CacheConfig::default(),
            compile: CompileConfig::default(),
            render: RenderConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:7340".to_string(),
            },
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate llm
    if config.llm.model.trim().is_empty() {
        anyhow::bail!("llm.model must not be empty");
    }
    if !config.llm.base_url.starts_with("http://") && !config.llm.base_url.starts_with("https://")
    {
        anyhow::bail!("llm.base_url must be an http(s) URL");
    }
    if config.llm.research_max_tokens == 0 || config.llm.outline_max_tokens == 0 {
        anyhow::bail!("llm max token limits must be > 0");
    }
    if let Some(t) = config.llm.temperature {
        if !(0.0..=2.0).contains(&t) {
            anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
        }
    }

    // Validate runtime + cache
    if config.runtime.timeout_secs == 0 {
        anyhow::bail!("runtime.timeout_secs must be > 0");
    }
    if config.cache.max_size_bytes == 0 {
        anyhow::bail!("cache.max_size_bytes must be > 0");
    }
    if config.compile.max_parallel == 0 {
        anyhow::bail!("compile.max_parallel must be >= 1");
    }

    match config.render.renderer.as_str() {
        "marp" | "passthrough" => {}
        other => anyhow::bail!(
            "Unknown renderer: '{}'. Must be marp or passthrough.",
            other
        ),
    }

    Ok(config)
}
