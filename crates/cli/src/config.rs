//! Configuration loading from toolwire.toml.
//!
//! Precedence: file, then environment, then command-line flags.

use std::path::Path;
use std::time::Duration;

use mcp::{ServerConfig, SessionConfig};
use runtime::{AgentConfig, ToolChoice};
use serde::Deserialize;
use url::Url;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub client: ClientSection,
    pub agent: AgentSection,
}

/// Tool host settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address.
    pub addr: String,
    pub name: String,
    pub max_concurrent_calls: usize,
    /// Seconds; 0 disables.
    pub idle_timeout_secs: u64,
    /// Base URL for the `get_current_weather` tool.
    pub weather_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            name: "toolwire".to_string(),
            max_concurrent_calls: 64,
            idle_timeout_secs: 300,
            weather_url: "https://wttr.in/".to_string(),
        }
    }
}

/// Client session settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Base URL of the tool host.
    pub url: String,
    pub call_timeout_secs: u64,
    pub max_in_flight: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            call_timeout_secs: 30,
            max_in_flight: 64,
        }
    }
}

/// Agent and model settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub model: String,
    /// OpenAI-compatible API base URL.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub instructions: String,
    /// One of `auto`, `required`, `none`.
    pub tool_choice: String,
    pub max_turns: usize,
    pub max_parallel_tools: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            base_url: None,
            api_key: None,
            instructions: "Use the tools to answer the questions.".to_string(),
            tool_choice: "required".to_string(),
            max_turns: 10,
            max_parallel_tools: 8,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load from `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            tracing::debug!(path = %path.display(), "loading config");
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("TOOLWIRE_ADDR") {
            self.server.addr = addr;
        }
        if let Some(url) = var("TOOLWIRE_URL") {
            self.client.url = url;
        }
        if let Some(key) = var("OPENAI_API_KEY") {
            self.agent.api_key = Some(key);
        }
        if let Some(base_url) = var("OPENAI_BASE_URL") {
            self.agent.base_url = Some(base_url);
        }
        if let Some(model) = var("TOOLWIRE_MODEL") {
            self.agent.model = model;
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        let idle = (self.server.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.server.idle_timeout_secs));
        ServerConfig::default()
            .with_name(&self.server.name)
            .with_max_concurrent_calls(self.server.max_concurrent_calls)
            .with_session_idle_timeout(idle)
    }

    pub fn weather_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.server.weather_url)
            .map_err(|e| ConfigError::Invalid(format!("server.weather_url: {e}")))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_call_timeout(Duration::from_secs(self.client.call_timeout_secs))
            .with_max_in_flight(self.client.max_in_flight)
    }

    pub fn agent_config(&self) -> Result<AgentConfig, ConfigError> {
        let tool_choice: ToolChoice = self
            .agent
            .tool_choice
            .parse()
            .map_err(ConfigError::Invalid)?;
        Ok(AgentConfig::default()
            .with_instructions(&self.agent.instructions)
            .with_tool_choice(tool_choice)
            .with_max_turns(self.agent.max_turns)
            .with_max_parallel_tools(self.agent.max_parallel_tools))
    }

    pub fn api_key(&self) -> Result<&str, ConfigError> {
        self.agent
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("model API key not configured: set OPENAI_API_KEY or agent.api_key")]
    MissingApiKey,
}
