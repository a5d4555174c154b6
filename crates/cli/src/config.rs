//! Configuration loading from parley.toml.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use runtime::{ConversationMode, SessionSettings};
use serde::Deserialize;
use storage::{ConfigStore, ModelCredentials, ServerSpec};

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// The model to chat with.
    pub model: ModelConfig,

    #[serde(default)]
    pub prompt: PromptConfig,

    /// Tool servers, in registration order.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// An OpenAI-compatible model endpoint.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    /// Name the model is stored under.
    #[serde(default = "default_model_id")]
    pub id: String,

    /// Base URL, e.g. `http://localhost:8080/v1`.
    pub endpoint: String,

    /// API key. Mutually exclusive with `api_key_env`.
    pub api_key: Option<String>,

    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,

    /// Model name sent with each request.
    pub model: String,

    #[serde(default = "default_context_size")]
    pub context_size: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    pub max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PromptConfig {
    pub system: Option<String>,

    #[serde(default)]
    pub mode: ConversationMode,
}

/// A tool server launched over stdio.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub id: String,

    /// Display name; defaults to the id.
    pub name: Option<String>,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Tools that run without asking (`"*"` for all).
    #[serde(default)]
    pub auto_approve: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_model_id() -> String {
    "default".to_string()
}

fn default_context_size() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut seen = BTreeSet::new();
        for server in &config.servers {
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::DuplicateServer(server.id.clone()));
            }
        }
        Ok(config)
    }

    /// Resolve the model's credentials, reading the API key from the environment if asked.
    pub fn credentials(&self) -> Result<ModelCredentials, ConfigError> {
        let model = &self.model;
        let api_key = match (&model.api_key, &model.api_key_env) {
            (Some(key), None) => key.clone(),
            (None, Some(var)) => {
                std::env::var(var).map_err(|_| ConfigError::MissingApiKey(var.clone()))?
            }
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousAuth),
            // Local servers often need no key.
            (None, None) => String::new(),
        };
        Ok(ModelCredentials {
            endpoint: model.endpoint.clone(),
            api_key,
            model: model.model.clone(),
            context_size: model.context_size,
            temperature: model.temperature,
            max_tokens: model.max_tokens,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        let mut settings = SessionSettings::new(self.model.id.as_str()).with_mode(self.prompt.mode);
        if let Some(system) = &self.prompt.system {
            settings = settings.with_system_prompt(system.as_str());
        }
        settings
    }

    /// Write servers, model and auto-approvals into the store.
    ///
    /// Auto-approvals are merged: permanent grants made earlier are kept.
    pub fn seed(&self, store: &dyn ConfigStore) -> crate::Result<()> {
        for server in &self.servers {
            store.upsert_server(&server.spec())?;
            if !server.auto_approve.is_empty() {
                let mut approved = store.auto_approval(&server.id)?;
                approved.extend(server.auto_approve.iter().cloned());
                store.set_auto_approval(&server.id, &approved)?;
            }
        }
        store.upsert_model(&self.model.id, &self.credentials()?)?;
        Ok(())
    }
}

impl ServerConfig {
    pub fn spec(&self) -> ServerSpec {
        ServerSpec {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("server '{0}' is defined more than once")]
    DuplicateServer(String),

    #[error("API key variable {0} is not set")]
    MissingApiKey(String),

    #[error("ambiguous authentication: set either model.api_key OR model.api_key_env, not both")]
    AmbiguousAuth,
}
