use crate::relay::RelayOptions;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub ollama: OllamaConfig,
    pub openai: ProviderConfig,
    pub perplexity: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// CORS origins; "*" allows any.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8000".to_string(),
                "*".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub models_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            request_timeout_secs: 120,
            health_timeout_secs: 5,
            models_timeout_secs: 10,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
        }
    }
}

/// Hosted provider settings. `base_url` falls back to the provider default.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }

    /// File (or defaults) with environment overrides applied.
    pub fn resolve(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut cfg = Self::load_optional(path)?.unwrap_or_default();
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Overlay the environment variables the web client's backend has always read.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("PORT is not a valid port: {port}"))?;
        }
        if let Some(url) = var("OLLAMA_BASE_URL") {
            self.ollama.base_url = url;
        }
        if let Some(secs) = var("OLLAMA_TIMEOUT") {
            self.relay.request_timeout_secs = secs
                .parse()
                .with_context(|| format!("OLLAMA_TIMEOUT is not a number of seconds: {secs}"))?;
        }
        if let Some(key) = var("OPENAI_API_KEY") {
            self.openai.api_key = Some(key);
        }
        if let Some(key) = var("PERPLEXITY_API_KEY") {
            self.perplexity.api_key = Some(key);
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        addr.parse()
            .with_context(|| format!("invalid listen address: {addr}"))
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            idle_timeout: Duration::from_secs(self.relay.idle_timeout_secs.max(1)),
            request_timeout: Duration::from_secs(self.relay.request_timeout_secs.max(1)),
            health_timeout: Duration::from_secs(self.relay.health_timeout_secs.max(1)),
            models_timeout: Duration::from_secs(self.relay.models_timeout_secs.max(1)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.connect_timeout_secs.max(1))
    }
}
