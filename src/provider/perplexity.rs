use super::openai::OpenAiCompatProvider;
use super::{
    ChatRequest, ChatResponse, EventStream, ModelInfo, Provider, ProviderKind, StreamControl,
};
use crate::error::RelayError;
use futures_util::future::BoxFuture;
use reqwest::StatusCode;
use serde_json::json;

pub const DEFAULT_BASE_URL: &str = "https://api.perplexity.ai";

/// Perplexity has no listing endpoint.
const CATALOG: [(&str, &str); 5] = [
    (
        "llama-3.1-sonar-small-128k-online",
        "Llama 3.1 Sonar Small 128K Online - Fast model with web access",
    ),
    (
        "llama-3.1-sonar-large-128k-online",
        "Llama 3.1 Sonar Large 128K Online - Powerful model with web access",
    ),
    (
        "llama-3.1-sonar-huge-128k-online",
        "Llama 3.1 Sonar Huge 128K Online - Most capable model with web access",
    ),
    ("llama-3.1-8b-instruct", "Llama 3.1 8B Instruct - Fast offline model"),
    ("llama-3.1-70b-instruct", "Llama 3.1 70B Instruct - Powerful offline model"),
];

#[derive(Debug, Clone)]
pub struct PerplexityProvider {
    inner: OpenAiCompatProvider,
}

impl PerplexityProvider {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            inner: OpenAiCompatProvider::new(ProviderKind::Perplexity, http, base_url, api_key)?,
        })
    }
}

impl Provider for PerplexityProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Perplexity
    }

    fn stream_chat(
        &self,
        req: ChatRequest,
        ctl: StreamControl,
    ) -> BoxFuture<'static, Result<EventStream, RelayError>> {
        self.inner.stream_chat(req, ctl)
    }

    fn complete(&self, req: &ChatRequest) -> Option<BoxFuture<'static, Result<ChatResponse, RelayError>>> {
        self.inner.complete(req)
    }

    fn list_models(&self) -> BoxFuture<'static, Result<Vec<ModelInfo>, RelayError>> {
        Box::pin(async move {
            Ok(CATALOG
                .iter()
                .map(|(name, description)| ModelInfo {
                    name: name.to_string(),
                    provider: ProviderKind::Perplexity,
                    size: None,
                    modified_at: None,
                    description: Some(description.to_string()),
                })
                .collect())
        })
    }

    /// One-token completion; a 400 still proves the API answered.
    fn health(&self) -> BoxFuture<'static, Result<bool, RelayError>> {
        let inner = self.inner.clone();

        Box::pin(async move {
            let headers = inner.headers()?;
            let url = inner.url("chat/completions")?;
            let probe = json!({
                "model": CATALOG[0].0,
                "messages": [{"role": "user", "content": "test"}],
                "max_tokens": 1,
            });
            let resp = inner.http().post(url).headers(headers).json(&probe).send().await?;
            Ok(matches!(resp.status(), StatusCode::OK | StatusCode::BAD_REQUEST))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn catalog_is_served_without_network() {
        let p = PerplexityProvider::new(reqwest::Client::new(), DEFAULT_BASE_URL, None).unwrap();
        let models = p.list_models().await.unwrap();
        assert_eq!(models.len(), CATALOG.len());
        assert!(models.iter().all(|m| m.provider == ProviderKind::Perplexity));
    }

    #[tokio::test]
    async fn health_without_key_fails_before_any_request() {
        let p = PerplexityProvider::new(reqwest::Client::new(), DEFAULT_BASE_URL, None).unwrap();
        assert!(matches!(p.health().await, Err(RelayError::AuthenticationMissing(_))));
    }
}
