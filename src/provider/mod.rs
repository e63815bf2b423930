mod types;
pub(crate) mod wire;

#[cfg(feature = "ollama")]
pub mod ollama;
#[cfg(any(feature = "openai", feature = "perplexity"))]
pub mod openai;
#[cfg(feature = "perplexity")]
pub mod perplexity;
#[cfg(test)]
pub(crate) mod stub;

pub use types::*;

use crate::error::RelayError;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-call controls handed to an adapter with each stream.
#[derive(Debug, Clone)]
pub struct StreamControl {
    /// Fired when the relay stops consuming.
    pub cancel: CancellationToken,
    /// Longest wait for the next upstream bytes before the stream fails.
    pub idle_timeout: Duration,
}

/// Provider adapter interface.
///
/// Adapters hold no per-request state and are shared read-only between
/// concurrent relay calls.
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Issue the upstream call and return its event stream.
    ///
    /// Reading the body happens while the stream is consumed. Firing
    /// `ctl.cancel` stops the read and closes the upstream connection. A gap
    /// longer than `ctl.idle_timeout` between body reads ends the stream with
    /// `UpstreamUnreachable`.
    fn stream_chat(
        &self,
        req: ChatRequest,
        ctl: StreamControl,
    ) -> BoxFuture<'static, Result<EventStream, RelayError>>;

    /// Native non-streaming completion, when the provider has one.
    fn complete(&self, _req: &ChatRequest) -> Option<BoxFuture<'static, Result<ChatResponse, RelayError>>> {
        None
    }

    fn list_models(&self) -> BoxFuture<'static, Result<Vec<ModelInfo>, RelayError>>;

    fn health(&self) -> BoxFuture<'static, Result<bool, RelayError>>;
}

/// Adapters by provider, fixed once built.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<ProviderKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter, replacing any previous one of the same kind.
    pub fn with(mut self, adapter: Arc<dyn Provider>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&Arc<dyn Provider>> {
        self.adapters.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProviderKind, &Arc<dyn Provider>)> {
        self.adapters.iter().map(|(k, v)| (*k, v))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.adapters.keys()).finish()
    }
}

/// Guard against a request reaching the wrong adapter.
pub(crate) fn ensure_identity(kind: ProviderKind, req: &ChatRequest) -> Result<(), RelayError> {
    if req.provider.parse::<ProviderKind>().ok() != Some(kind) {
        return Err(RelayError::InvalidRequest(format!(
            "request for provider '{}' sent to the {kind} adapter",
            req.provider
        )));
    }
    if req.model.trim().is_empty() {
        return Err(RelayError::InvalidRequest("model must not be empty".into()));
    }
    Ok(())
}

/// `{role, content}` as both Ollama and OpenAI-style APIs expect it.
#[cfg(any(feature = "ollama", feature = "openai", feature = "perplexity"))]
#[derive(Debug, serde::Serialize)]
pub(crate) struct WireMessage<'a> {
    pub role: Role,
    pub content: &'a str,
}

#[cfg(any(feature = "ollama", feature = "openai", feature = "perplexity"))]
pub(crate) fn wire_messages(req: &ChatRequest) -> Vec<WireMessage<'_>> {
    req.transcript()
        .into_iter()
        .map(|(role, content)| WireMessage { role, content })
        .collect()
}
