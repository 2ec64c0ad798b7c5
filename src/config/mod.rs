//! Layered configuration for the proxy and the chat client.
//!
//! Sources, later ones winning:
//!
//! 1. Built-in defaults
//! 2. `./bluebox.toml`, if present
//! 3. An explicit `--config` file
//! 4. `BLUEBOX_`-prefixed environment variables, `__` between sections
//!    (`BLUEBOX_UPSTREAM__MODEL=gpt-4.1-mini`)
//!
//! The upstream API key is not part of [`Settings`]; it is read
//! from `OPENAI_API_KEY` by [`api_key`].

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consumer::DEFAULT_ENDPOINT;
use crate::llm::openai::DEFAULT_BASE_URL;
use crate::proxy::ProxySettings;

/// Project-level config file picked up from the working directory.
pub const PROJECT_FILE: &str = "bluebox.toml";

pub const ENV_PREFIX: &str = "BLUEBOX_";

pub const API_KEY_VAR: &str = "OPENAI_API_KEY";

pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, knowledgeable assistant. Provide accurate, concise, and relevant information. Be friendly and conversational in your responses.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("config file {0} does not exist")]
    MissingFile(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("OPENAI_API_KEY is not set")]
    MissingApiKey,
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Load(Box::new(e))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address `bluebox serve` listens on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of an OpenAI-compatible API, without `/chat/completions`.
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            temperature: DEFAULT_TEMPERATURE,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Chat endpoint `bluebox chat` talks to.
    pub endpoint: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
        }
    }
}

/// Application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub client: ClientConfig,
}

impl Settings {
    /// Rejects values no upstream would accept.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let upstream = &self.upstream;
        if upstream.model.trim().is_empty() {
            return Err(ConfigError::Invalid("upstream.model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&upstream.temperature) {
            return Err(ConfigError::Invalid(format!(
                "upstream.temperature must be between 0 and 2, got {}",
                upstream.temperature
            )));
        }
        if upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("upstream.base_url must not be empty".into()));
        }
        Ok(())
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            model: self.upstream.model.clone(),
            temperature: self.upstream.temperature,
            system_prompt: self.upstream.system_prompt.clone(),
        }
    }
}

/// Builds [`Settings`] from every configured source.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(config_path: Option<&Path>) -> Result<Settings, ConfigError> {
        let figment = Self::files(config_path)?.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Like [`load`](Self::load) but ignores the environment.
    pub fn load_files(config_path: Option<&Path>) -> Result<Settings, ConfigError> {
        Self::extract(Self::files(config_path)?)
    }

    fn files(config_path: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Settings::default()));

        let project = Path::new(PROJECT_FILE);
        if project.exists() {
            figment = figment.merge(Toml::file(project));
        }

        if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }

        Ok(figment)
    }

    fn extract(figment: Figment) -> Result<Settings, ConfigError> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }
}

/// The upstream API key from `OPENAI_API_KEY`.
pub fn api_key() -> Result<SecretString, ConfigError> {
    match std::env::var(API_KEY_VAR) {
        Ok(key) if !key.trim().is_empty() => Ok(SecretString::from(key)),
        _ => Err(ConfigError::MissingApiKey),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.server.bind, "127.0.0.1:3000");
        assert_eq!(settings.upstream.model, DEFAULT_MODEL);
        assert_eq!(settings.client.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let file = config_file(
            r#"
            [server]
            bind = "0.0.0.0:8080"

            [upstream]
            model = "gpt-4.1-mini"
            temperature = 0.2
            "#,
        );
        let settings = ConfigLoader::load_files(Some(file.path())).unwrap();
        assert_eq!(settings.server.bind, "0.0.0.0:8080");
        assert_eq!(settings.upstream.model, "gpt-4.1-mini");
        assert_eq!(settings.upstream.temperature, 0.2);
        assert_eq!(settings.upstream.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn out_of_range_temperature_is_rejected() {
        let file = config_file("[upstream]\ntemperature = 3.5\n");
        let err = ConfigLoader::load_files(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_file_is_a_load_error() {
        let file = config_file("[upstream\nmodel = ");
        let err = ConfigLoader::load_files(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn missing_explicit_file_is_reported() {
        let err = ConfigLoader::load_files(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn proxy_settings_follow_upstream_section() {
        let settings = Settings::default();
        let proxy = settings.proxy_settings();
        assert_eq!(proxy.model, settings.upstream.model);
        assert_eq!(proxy.temperature, DEFAULT_TEMPERATURE);
    }
}
