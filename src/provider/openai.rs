//! OpenAI-compatible `chat/completions` adapter. Perplexity speaks the same
//! wire format and reuses this type with its own identity and catalog.

use super::wire::{self, Decoder, SseParser};
use super::{
    ensure_identity, wire_messages, ChatRequest, ChatResponse, EventStream, Metadata, ModelInfo,
    Provider, ProviderKind, StreamControl, StreamEvent, Usage, WireMessage, DEFAULT_TEMPERATURE,
};
use crate::error::RelayError;
use anyhow::Context;
use chrono::DateTime;
use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Model id fragments that identify chat-capable OpenAI models.
const CHAT_MODEL_FAMILIES: [&str; 4] = ["gpt-4", "gpt-4-turbo", "gpt-3.5-turbo", "gpt-4o"];

#[derive(Debug, Clone)]
pub struct OpenAiCompatProvider {
    kind: ProviderKind,
    http: reqwest::Client,
    api_base: Url,
    api_key: Option<String>,
}

impl OpenAiCompatProvider {
    pub fn new(
        kind: ProviderKind,
        http: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let base = format!("{}/", base_url.trim_end_matches('/'));
        let api_base =
            Url::parse(&base).with_context(|| format!("invalid {kind} base URL: {base_url}"))?;
        Ok(Self {
            kind,
            http,
            api_base,
            // An empty key in the environment means "not configured".
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn openai(http: reqwest::Client, base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        Self::new(ProviderKind::OpenAi, http, base_url, api_key)
    }

    pub(crate) fn url(&self, path: &str) -> Result<Url, RelayError> {
        self.api_base
            .join(path)
            .map_err(|e| RelayError::UpstreamUnreachable(format!("bad {} URL: {e}", self.kind)))
    }

    pub(crate) fn headers(&self) -> Result<HeaderMap, RelayError> {
        let key = self.api_key.as_deref().ok_or_else(|| {
            RelayError::AuthenticationMissing(format!("{} API key not configured", self.kind))
        })?;

        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let v = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
            RelayError::AuthenticationMissing(format!("{} API key is not a valid header: {e}", self.kind))
        })?;
        h.insert(AUTHORIZATION, v);
        Ok(h)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn chat_body<'a>(&self, req: &'a ChatRequest, stream: bool) -> CompletionBody<'a> {
        CompletionBody {
            model: &req.model,
            messages: wire_messages(req),
            stream,
            temperature: req.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: req.max_tokens,
            // Perplexity rejects stream_options.
            stream_options: (stream && self.kind == ProviderKind::OpenAi)
                .then_some(StreamOptions { include_usage: true }),
        }
    }
}

impl Provider for OpenAiCompatProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn stream_chat(
        &self,
        req: ChatRequest,
        ctl: StreamControl,
    ) -> BoxFuture<'static, Result<EventStream, RelayError>> {
        let this = self.clone();

        Box::pin(async move {
            ensure_identity(this.kind, &req)?;
            let headers = this.headers()?;
            let url = this.url("chat/completions")?;
            let body = this.chat_body(&req, true);

            tracing::debug!(provider = %this.kind, model = %req.model, "opening completion stream");
            let resp = wire::send(
                this.kind,
                this.http.post(url).headers(headers).json(&body),
            )
            .await?;

            Ok(wire::spawn_pump(this.kind, resp, SseDecoder::new(this.kind), ctl))
        })
    }

    fn complete(&self, req: &ChatRequest) -> Option<BoxFuture<'static, Result<ChatResponse, RelayError>>> {
        let this = self.clone();
        let req = req.clone();

        Some(Box::pin(async move {
            ensure_identity(this.kind, &req)?;
            let headers = this.headers()?;
            let url = this.url("chat/completions")?;
            let body = this.chat_body(&req, false);

            let resp = wire::send(this.kind, this.http.post(url).headers(headers).json(&body)).await?;
            let data: CompletionResponse = resp.json().await?;

            let choice = data.choices.into_iter().next().ok_or_else(|| {
                RelayError::UpstreamProtocolError(format!("{} response has no choices", this.kind))
            })?;

            let mut metadata = Metadata::new();
            metadata.insert("finish_reason".into(), json!(choice.finish_reason));
            metadata.insert("id".into(), json!(data.id));
            metadata.insert("created".into(), json!(data.created));
            if this.kind == ProviderKind::Perplexity {
                metadata.insert("citations".into(), json!(data.citations.unwrap_or_default()));
            }

            Ok(ChatResponse {
                message: choice.message.content.unwrap_or_default(),
                model: data.model.unwrap_or(req.model),
                provider: this.kind,
                usage: data.usage.map(WireUsage::normalize),
                metadata,
            })
        }))
    }

    fn list_models(&self) -> BoxFuture<'static, Result<Vec<ModelInfo>, RelayError>> {
        let this = self.clone();

        Box::pin(async move {
            let headers = this.headers()?;
            let url = this.url("models")?;
            let resp = wire::send(this.kind, this.http.get(url).headers(headers)).await?;
            let list: ModelList = resp.json().await?;

            Ok(list
                .data
                .into_iter()
                .filter(|m| CHAT_MODEL_FAMILIES.iter().any(|f| m.id.contains(f)))
                .map(|m| ModelInfo {
                    description: Some(format!("OpenAI model: {}", m.id)),
                    modified_at: m.created.and_then(|t| DateTime::from_timestamp(t, 0)),
                    size: None,
                    provider: this.kind,
                    name: m.id,
                })
                .collect())
        })
    }

    fn health(&self) -> BoxFuture<'static, Result<bool, RelayError>> {
        let this = self.clone();

        Box::pin(async move {
            let headers = this.headers()?;
            let url = this.url("models")?;
            let resp = this.http.get(url).headers(headers).send().await?;
            Ok(resp.status().is_success())
        })
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    id: Option<String>,
    model: Option<String>,
    created: Option<i64>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<WireUsage>,
    citations: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl WireUsage {
    fn normalize(self) -> Usage {
        Usage::new(self.prompt_tokens, self.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
    citations: Option<Vec<serde_json::Value>>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
    code: Option<String>,
}

/// `data:` events carrying completion chunks, ended by `data: [DONE]`.
struct SseDecoder {
    kind: ProviderKind,
    parser: SseParser,
    /// Carried into the terminal event.
    last: Metadata,
}

impl SseDecoder {
    fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            parser: SseParser::default(),
            last: Metadata::new(),
        }
    }

    fn decode_data(&mut self, data: &str) -> Vec<Result<StreamEvent, RelayError>> {
        let data = data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            return vec![Ok(StreamEvent::Done {
                metadata: std::mem::take(&mut self.last),
            })];
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                return vec![Err(RelayError::UpstreamProtocolError(format!(
                    "failed to parse {} SSE JSON: {e}",
                    self.kind
                )))]
            }
        };

        if let Some(err) = chunk.error {
            let message = format!("{} API error: {}", self.kind, err.message);
            return vec![Err(match err.code.as_deref() {
                Some("model_not_found") => RelayError::InvalidModel(message),
                Some("invalid_api_key") => RelayError::AuthenticationMissing(message),
                _ => RelayError::UpstreamProtocolError(message),
            })];
        }

        let mut metadata = Metadata::new();
        metadata.insert("model".into(), json!(chunk.model));
        metadata.insert("id".into(), json!(chunk.id));

        if let Some(usage) = chunk.usage {
            self.last.insert("usage".into(), usage.normalize().to_value());
        }
        if self.kind == ProviderKind::Perplexity {
            metadata.insert("citations".into(), json!(chunk.citations.unwrap_or_default()));
        }

        let mut out = Vec::new();
        for choice in chunk.choices {
            metadata.insert("finish_reason".into(), json!(choice.finish_reason));
            if choice.finish_reason.is_some() {
                for key in ["model", "id", "finish_reason"] {
                    if let Some(v) = metadata.get(key) {
                        self.last.insert(key.into(), v.clone());
                    }
                }
            }
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(Ok(StreamEvent::Partial {
                    content,
                    metadata: metadata.clone(),
                }));
            }
        }
        out
    }
}

impl Decoder for SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, RelayError>> {
        let mut out = Vec::new();
        for data in self.parser.push(chunk) {
            match data {
                Ok(data) => out.extend(self.decode_data(&data)),
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<Result<StreamEvent, RelayError>> {
        let mut out = Vec::new();
        for data in self.parser.finish() {
            match data {
                Ok(data) => out.extend(self.decode_data(&data)),
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(kind: ProviderKind, input: &str) -> Vec<StreamEvent> {
        let mut d = SseDecoder::new(kind);
        let mut out = d.push(input.as_bytes());
        out.extend(d.finish());
        out.into_iter().map(Result::unwrap).collect()
    }

    #[test]
    fn deltas_then_done_carry_usage_and_finish_reason() {
        let input = concat!(
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        let out = decode(ProviderKind::OpenAi, input);
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], StreamEvent::Partial { content, .. } if content == "Hel"));
        let StreamEvent::Partial { metadata, .. } = &out[1] else {
            panic!("expected partial");
        };
        assert_eq!(metadata["finish_reason"], "stop");
        let StreamEvent::Done { metadata } = &out[2] else {
            panic!("expected done");
        };
        assert_eq!(metadata["finish_reason"], "stop");
        assert_eq!(Usage::from_metadata(metadata), Some(Usage::new(3, 2)));
    }

    #[test]
    fn perplexity_partials_carry_citations() {
        let input = "data: {\"id\":\"p\",\"model\":\"sonar\",\"citations\":[\"https://example.com\"],\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n";
        let out = decode(ProviderKind::Perplexity, input);
        let StreamEvent::Partial { metadata, .. } = &out[0] else {
            panic!("expected partial");
        };
        assert_eq!(metadata["citations"][0], "https://example.com");
    }

    #[test]
    fn error_payload_maps_to_taxonomy() {
        let mut d = SseDecoder::new(ProviderKind::OpenAi);
        let out = d.push(b"data: {\"error\":{\"message\":\"The model `gpt-9` does not exist\",\"code\":\"model_not_found\"}}\n\n");
        assert!(matches!(out[0], Err(RelayError::InvalidModel(_))));
    }

    #[test]
    fn malformed_json_is_protocol_error() {
        let mut d = SseDecoder::new(ProviderKind::OpenAi);
        let out = d.push(b"data: {oops\n\n");
        assert!(matches!(out[0], Err(RelayError::UpstreamProtocolError(_))));
    }

    #[test]
    fn missing_key_is_authentication_missing() {
        let p = OpenAiCompatProvider::openai(reqwest::Client::new(), DEFAULT_BASE_URL, Some(" ".into()))
            .unwrap();
        assert!(matches!(p.headers(), Err(RelayError::AuthenticationMissing(_))));
    }

    #[test]
    fn stream_options_only_for_openai() {
        let http = reqwest::Client::new();
        let req = ChatRequest::new("openai", "gpt-4o", "hi");
        let openai = OpenAiCompatProvider::openai(http.clone(), DEFAULT_BASE_URL, None).unwrap();
        let body = serde_json::to_value(openai.chat_body(&req, true)).unwrap();
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("max_tokens").is_none());

        let pplx = OpenAiCompatProvider::new(ProviderKind::Perplexity, http, DEFAULT_BASE_URL, None)
            .unwrap();
        let body = serde_json::to_value(pplx.chat_body(&req, true)).unwrap();
        assert!(body.get("stream_options").is_none());
    }
}
