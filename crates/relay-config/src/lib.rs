//! Layered TOML configuration for Relay.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use relay_mcp::{Launchers, McpConfig};
use relay_types::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The default model name.
pub const DEFAULT_MODEL: &str = "llama3.2";

/// The default per-step model timeout.
pub const DEFAULT_MODEL_TIMEOUT_MS: u64 = 120_000;

pub const DEFAULT_MAX_STEPS: usize = 10;
pub const DEFAULT_MAX_TOOL_CALLS: usize = 25;

/// Resolved configuration for a Relay session.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub model: String,
    pub base_url: String,
    pub model_timeout_ms: u64,
    pub system_prompt: Option<String>,
    pub max_steps: usize,
    pub max_tool_calls: usize,
    pub launchers: Launchers,
    pub mcp: McpConfig,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default, rename = "loop")]
    pub limits: LoopSettings,
    #[serde(default)]
    pub launchers: Launchers,
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSettings {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub system_prompt: Option<String>,
}

/// The `[loop]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopSettings {
    pub max_steps: Option<usize>,
    pub max_tool_calls: Option<usize>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub max_steps: Option<usize>,
}

impl RelayConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables (`RELAY_MODEL`, `OLLAMA_HOST`)
    /// 3. Config file (`<config dir>/config.toml`)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        Self::load_with(config_dir(), overrides, |key| std::env::var(key).ok())
    }

    /// [`RelayConfig::load`] with an explicit config dir and environment lookup.
    pub fn load_with(
        config_dir: PathBuf,
        overrides: CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let settings = load_settings_file(&config_dir.join("config.toml"));

        let model = overrides
            .model
            .or_else(|| env("RELAY_MODEL"))
            .or(settings.model.name)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        if model.trim().is_empty() {
            return Err(invalid("model.name", "must not be empty"));
        }

        let base_url = overrides
            .base_url
            .or_else(|| env("OLLAMA_HOST").map(|host| normalize_host(&host)))
            .or(settings.model.base_url)
            .unwrap_or_else(|| relay_api::DEFAULT_BASE_URL.to_string());

        let model_timeout_ms = settings
            .model
            .timeout_ms
            .unwrap_or(DEFAULT_MODEL_TIMEOUT_MS);
        if model_timeout_ms == 0 {
            return Err(invalid("model.timeout_ms", "must be greater than zero"));
        }

        let max_steps = overrides
            .max_steps
            .or(settings.limits.max_steps)
            .unwrap_or(DEFAULT_MAX_STEPS);
        if max_steps == 0 {
            return Err(invalid("loop.max_steps", "must be at least 1"));
        }

        let max_tool_calls = settings
            .limits
            .max_tool_calls
            .unwrap_or(DEFAULT_MAX_TOOL_CALLS);
        if max_tool_calls == 0 {
            return Err(invalid("loop.max_tool_calls", "must be at least 1"));
        }

        Ok(RelayConfig {
            model,
            base_url,
            model_timeout_ms,
            system_prompt: settings.model.system_prompt,
            max_steps,
            max_tool_calls,
            launchers: settings.launchers,
            mcp: settings.mcp,
            config_dir,
        })
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }
}

/// Get the Relay config directory path (~/.relay/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RELAY_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relay")
}

/// `OLLAMA_HOST` is often a bare `host:port`.
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        message: message.into(),
    }
}

/// Load and parse a TOML settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}
