//! Engine configuration
//!
//! Loaded from `COMPANION_*` environment variables or from the desktop
//! app's JSON config file, whose `"llm"` section carries the backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:80/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Errors loading or validating a [`ChatConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Backend connection and conversation settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Full chat-completions endpoint URL
    #[serde(alias = "base_url")]
    pub server_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    /// Inactivity timeout per turn
    pub timeout_ms: u64,
    pub stream: bool,
    /// Strip `<think>` blocks from replies before storing them
    pub enable_thinking: bool,
    /// Append ` /think` or ` /no_think` to the system prompt
    pub think_directive: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            system_prompt: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            stream: false,
            enable_thinking: false,
            think_directive: false,
        }
    }
}

impl fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatConfig")
            .field("server_url", &self.server_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("system_prompt", &self.system_prompt)
            .field("timeout_ms", &self.timeout_ms)
            .field("stream", &self.stream)
            .field("enable_thinking", &self.enable_thinking)
            .field("think_directive", &self.think_directive)
            .finish()
    }
}

/// `"llm"` section of the desktop app's config file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LlmSection {
    model: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    stream: Option<bool>,
    enable_thinking: Option<bool>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AppConfigFile {
    llm: LlmSection,
    #[serde(default)]
    system_prompt: Option<String>,
}

impl ChatConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = env_var("COMPANION_SERVER_URL") {
            config.server_url = url;
        }
        config.api_key = env_var("COMPANION_API_KEY").or_else(|| env_var("OPENAI_API_KEY"));
        if let Some(model) = env_var("COMPANION_MODEL") {
            config.model = model;
        }
        if let Some(prompt) = env_var("COMPANION_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
        }
        if let Some(value) = env_var("COMPANION_TIMEOUT_MS") {
            config.timeout_ms = value.parse().map_err(|_| ConfigError::Env {
                var: "COMPANION_TIMEOUT_MS",
                value,
            })?;
        }
        if let Some(value) = env_var("COMPANION_STREAM") {
            config.stream = parse_flag("COMPANION_STREAM", value)?;
        }
        if let Some(value) = env_var("COMPANION_ENABLE_THINKING") {
            config.enable_thinking = parse_flag("COMPANION_ENABLE_THINKING", value)?;
        }
        Ok(config)
    }

    /// Load a JSON config file. A file with an `"llm"` section is read as
    /// the desktop app's config; anything else as a flat `ChatConfig`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };

        let value: serde_json::Value = serde_json::from_str(&text).map_err(parse_err)?;
        if value.get("llm").is_none() {
            return serde_json::from_value(value).map_err(parse_err);
        }

        let app: AppConfigFile = serde_json::from_value(value).map_err(parse_err)?;
        let mut config = Self::default();
        let llm = app.llm;
        if let Some(base) = llm.base_url {
            config.server_url = chat_endpoint(&base);
        }
        config.api_key = llm
            .api_key
            .or_else(|| env_var("LLM_API_KEY"))
            .or_else(|| env_var("OPENAI_API_KEY"));
        if let Some(model) = llm.model {
            config.model = model;
        }
        if let Some(prompt) = app.system_prompt {
            config.system_prompt = prompt;
        }
        config.stream = llm.stream.unwrap_or(config.stream);
        config.enable_thinking = llm.enable_thinking.unwrap_or(config.enable_thinking);
        config.timeout_ms = llm.timeout_ms.unwrap_or(config.timeout_ms);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server_url is empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// System prompt as sent on the wire, `None` when there is nothing to send.
    pub fn effective_system_prompt(&self) -> Option<String> {
        let mut prompt = self.system_prompt.clone();
        if self.think_directive {
            prompt.push_str(if self.enable_thinking { " /think" } else { " /no_think" });
        }
        (!prompt.is_empty()).then_some(prompt)
    }
}

/// `https://host/v1` → `https://host/v1/chat/completions`
fn chat_endpoint(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with(CHAT_COMPLETIONS_PATH) {
        base.to_string()
    } else {
        format!("{base}{CHAT_COMPLETIONS_PATH}")
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_flag(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env { var, value }),
    }
}
