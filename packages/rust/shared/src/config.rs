//! Application configuration for rowforge.
//!
//! User config lives at `~/.rowforge/rowforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RowForgeError};
use crate::types::ModelConfig;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "rowforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".rowforge";

// ---------------------------------------------------------------------------
// Config structs (matching rowforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults (the master level of every hierarchy).
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Concurrency pool sizes.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Response/fetch cache.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default chat model.
    #[serde(default = "default_model")]
    pub model: String,

    /// Total attempts for schema-constrained calls.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Step timeout in seconds (covers embedded retries).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Default candidate count per step.
    #[serde(default = "default_candidates")]
    pub candidates: usize,

    /// Default artifact output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            candidates: default_candidates(),
            output_dir: default_output_dir(),
        }
    }
}

impl DefaultsConfig {
    /// Master-level model settings.
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model: self.model.clone(),
            temperature: None,
            reasoning_effort: None,
            generate_images: false,
            aspect_ratio: None,
        }
    }
}

fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_candidates() -> usize {
    1
}
fn default_output_dir() -> String {
    "out".into()
}

/// `[concurrency]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Rows in flight at once.
    #[serde(default = "default_tasks")]
    pub tasks: usize,

    /// Model calls in flight at once.
    #[serde(default = "default_requests")]
    pub requests: usize,

    /// Page visits in flight at once.
    #[serde(default = "default_pages")]
    pub pages: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            tasks: default_tasks(),
            requests: default_requests(),
            pages: default_pages(),
        }
    }
}

fn default_tasks() -> usize {
    4
}
fn default_requests() -> usize {
    8
}
fn default_pages() -> usize {
    4
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Database path. Empty means `~/.rowforge/cache.db`.
    #[serde(default)]
    pub path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: String::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.rowforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| RowForgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.rowforge/rowforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the cache database path, falling back to the config directory.
pub fn cache_db_path(config: &AppConfig) -> Result<PathBuf> {
    if config.cache.path.is_empty() {
        Ok(config_dir()?.join("cache.db"))
    } else {
        Ok(PathBuf::from(&config.cache.path))
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
    let content = std::fs::read_to_string(path).map_err(|e| RowForgeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| RowForgeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RowForgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RowForgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RowForgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the OpenRouter API key from the configured env var.
pub fn api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(RowForgeError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_retries"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.max_retries, 3);
        assert_eq!(parsed.concurrency.requests, 8);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
model = "anthropic/claude-sonnet-4"

[concurrency]
tasks = 16
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.model, "anthropic/claude-sonnet-4");
        assert_eq!(config.defaults.timeout_secs, 300);
        assert_eq!(config.concurrency.tasks, 16);
        assert_eq!(config.concurrency.pages, 4);
        assert!(config.cache.enabled);
    }

    #[test]
    fn explicit_cache_path_wins() {
        let mut config = AppConfig::default();
        config.cache.path = "/tmp/rowforge-cache.db".into();
        let path = cache_db_path(&config).expect("path");
        assert_eq!(path, PathBuf::from("/tmp/rowforge-cache.db"));
    }

    #[test]
    fn api_key_missing() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "RF_TEST_NONEXISTENT_KEY_12345".into();
        let result = api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
