use crate::error::{ErrorKind, RelayError};
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form provider metadata attached to events and responses.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Single-pass sequence of normalized events produced by an adapter.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Reachability per provider name.
pub type ProviderHealth = BTreeMap<String, bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    OpenAi,
    Perplexity,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::Perplexity => "perplexity",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            "perplexity" => Ok(Self::Perplexity),
            _ => Err(RelayError::UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A chat request as submitted by a client.
///
/// `provider` stays a plain string until the relay resolves it, so that an
/// unrecognized name is reported as an unknown provider rather than a
/// malformed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default, alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    #[serde(default, alias = "maxTokens")]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
}

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_provider() -> String {
    ProviderKind::Ollama.as_str().to_string()
}

fn default_stream() -> bool {
    true
}

fn default_temperature() -> Option<f32> {
    Some(DEFAULT_TEMPERATURE)
}

impl ChatRequest {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            model: model.into(),
            provider: provider.into(),
            stream: true,
            history: Vec::new(),
            system_prompt: None,
            max_tokens: None,
            temperature: default_temperature(),
        }
    }

    /// Check the request shape. Called by the relay before any adapter runs.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.model.trim().is_empty() {
            return Err(RelayError::InvalidRequest("model must not be empty".into()));
        }
        if self.message.trim().is_empty() {
            return Err(RelayError::InvalidRequest("message must not be empty".into()));
        }
        if let Some(pos) = self
            .history
            .iter()
            .position(|m| m.role != Role::System && m.content.is_empty())
        {
            return Err(RelayError::InvalidRequest(format!(
                "history[{pos}] has empty content"
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(RelayError::InvalidRequest("max_tokens must be greater than 0".into()));
        }
        if let Some(t) = self.temperature {
            if !t.is_finite() || !(0.0..=2.0).contains(&t) {
                return Err(RelayError::InvalidRequest(format!(
                    "temperature must be within [0, 2], got {t}"
                )));
            }
        }
        Ok(())
    }

    /// Conversation in send order: system prompt, history, then the new message.
    pub fn transcript(&self) -> Vec<(Role, &str)> {
        let mut out = Vec::with_capacity(self.history.len() + 2);
        if let Some(system) = self.system_prompt.as_deref() {
            out.push((Role::System, system));
        }
        out.extend(self.history.iter().map(|m| (m.role, m.content.as_str())));
        out.push((Role::User, self.message.as_str()));
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Read the `usage` entry adapters attach to their terminal metadata.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let usage = metadata.get("usage")?.as_object()?;
        let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64());
        let completion = usage.get("completion_tokens").and_then(|v| v.as_u64());
        match (prompt, completion) {
            (None, None) => None,
            (p, c) => Some(Self::new(p.unwrap_or(0), c.unwrap_or(0))),
        }
    }

    pub fn to_value(self) -> serde_json::Value {
        serde_json::json!({
            "prompt_tokens": self.prompt_tokens,
            "completion_tokens": self.completion_tokens,
            "total_tokens": self.total_tokens,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub model: String,
    pub provider: ProviderKind,
    pub usage: Option<Usage>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Partial { content: String, metadata: Metadata },
    Done { metadata: Metadata },
    Error { kind: ErrorKind, message: String },
}

impl StreamEvent {
    pub fn partial(content: impl Into<String>) -> Self {
        Self::Partial {
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn done() -> Self {
        Self::Done {
            metadata: Metadata::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Partial { .. })
    }
}

impl From<RelayError> for StreamEvent {
    fn from(err: RelayError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: ProviderKind,
    pub size: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
}
