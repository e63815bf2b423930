//! Ollama HTTP API: NDJSON chat streaming, native completion, tags, health.

use super::wire::{self, Decoder, LineBuffer};
use super::{
    ensure_identity, wire_messages, ChatRequest, ChatResponse, EventStream, Metadata, ModelInfo,
    Provider, ProviderKind, StreamControl, StreamEvent, Usage, WireMessage, DEFAULT_TEMPERATURE,
};
use crate::error::RelayError;
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    http: reqwest::Client,
    api_base: Url,
}

impl OllamaProvider {
    pub fn new(http: reqwest::Client, base_url: &str) -> anyhow::Result<Self> {
        // Url::join drops the last path segment unless it ends with '/'.
        let base = format!("{}/", base_url.trim_end_matches('/'));
        let api_base = Url::parse(&base)
            .with_context(|| format!("invalid Ollama base URL: {base_url}"))?;
        Ok(Self { http, api_base })
    }

    fn url(&self, path: &str) -> Result<Url, RelayError> {
        self.api_base
            .join(path)
            .map_err(|e| RelayError::UpstreamUnreachable(format!("bad Ollama URL: {e}")))
    }

    fn chat_body<'a>(req: &'a ChatRequest, stream: bool) -> OllamaChatBody<'a> {
        OllamaChatBody {
            model: &req.model,
            messages: wire_messages(req),
            stream,
            options: OllamaOptions {
                temperature: req.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                num_predict: req.max_tokens,
            },
        }
    }
}

impl Provider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn stream_chat(
        &self,
        req: ChatRequest,
        ctl: StreamControl,
    ) -> BoxFuture<'static, Result<EventStream, RelayError>> {
        let this = self.clone();

        Box::pin(async move {
            ensure_identity(ProviderKind::Ollama, &req)?;
            let url = this.url("api/chat")?;
            let body = Self::chat_body(&req, true);

            tracing::debug!(model = %req.model, %url, "opening Ollama stream");
            let resp = wire::send(ProviderKind::Ollama, this.http.post(url).json(&body)).await?;

            Ok(wire::spawn_pump(
                ProviderKind::Ollama,
                resp,
                NdjsonDecoder::new(req.model),
                ctl,
            ))
        })
    }

    fn complete(&self, req: &ChatRequest) -> Option<BoxFuture<'static, Result<ChatResponse, RelayError>>> {
        let this = self.clone();
        let req = req.clone();

        Some(Box::pin(async move {
            ensure_identity(ProviderKind::Ollama, &req)?;
            let url = this.url("api/chat")?;
            let body = Self::chat_body(&req, false);

            let resp = wire::send(ProviderKind::Ollama, this.http.post(url).json(&body)).await?;
            let mut chunk: OllamaChatChunk = resp.json().await?;
            if let Some(err) = chunk.error.take() {
                return Err(classify_error(err));
            }

            let usage = chunk.usage();
            let mut metadata = chunk.done_metadata(&req.model);
            metadata.remove("usage");
            metadata.insert("done".into(), json!(chunk.done));

            Ok(ChatResponse {
                message: chunk.message.map(|m| m.content).unwrap_or_default(),
                model: req.model,
                provider: ProviderKind::Ollama,
                usage,
                metadata,
            })
        }))
    }

    fn list_models(&self) -> BoxFuture<'static, Result<Vec<ModelInfo>, RelayError>> {
        let this = self.clone();

        Box::pin(async move {
            let url = this.url("api/tags")?;
            let resp = wire::send(ProviderKind::Ollama, this.http.get(url)).await?;
            let tags: TagsResponse = resp.json().await?;

            Ok(tags
                .models
                .into_iter()
                .map(|m| ModelInfo {
                    description: Some(format!("Ollama model: {}", m.name)),
                    modified_at: m.modified_at.as_deref().and_then(parse_timestamp),
                    size: m.size,
                    provider: ProviderKind::Ollama,
                    name: m.name,
                })
                .collect())
        })
    }

    fn health(&self) -> BoxFuture<'static, Result<bool, RelayError>> {
        let this = self.clone();

        Box::pin(async move {
            let url = this.url("api/tags")?;
            let resp = this.http.get(url).send().await?;
            Ok(resp.status().is_success())
        })
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn classify_error(message: String) -> RelayError {
    if message.contains("not found") {
        RelayError::InvalidModel(message)
    } else {
        RelayError::UpstreamProtocolError(message)
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    model: Option<String>,
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    error: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
    total_duration: Option<u64>,
    load_duration: Option<u64>,
    prompt_eval_duration: Option<u64>,
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaChatChunk {
    fn usage(&self) -> Option<Usage> {
        match (self.prompt_eval_count, self.eval_count) {
            (None, None) => None,
            (p, c) => Some(Usage::new(p.unwrap_or(0), c.unwrap_or(0))),
        }
    }

    fn done_metadata(&self, requested_model: &str) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert(
            "model".into(),
            json!(self.model.as_deref().unwrap_or(requested_model)),
        );
        if let Some(reason) = &self.done_reason {
            meta.insert("done_reason".into(), json!(reason));
        }
        for (key, value) in [
            ("total_duration", self.total_duration),
            ("load_duration", self.load_duration),
            ("prompt_eval_duration", self.prompt_eval_duration),
            ("eval_duration", self.eval_duration),
        ] {
            if let Some(v) = value {
                meta.insert(key.into(), json!(v));
            }
        }
        if let Some(usage) = self.usage() {
            meta.insert("usage".into(), usage.to_value());
        }
        meta
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    size: Option<u64>,
    modified_at: Option<String>,
}

/// One JSON object per line; the line with `"done": true` ends the stream.
struct NdjsonDecoder {
    lines: LineBuffer,
    model: String,
}

impl NdjsonDecoder {
    fn new(model: String) -> Self {
        Self {
            lines: LineBuffer::default(),
            model,
        }
    }

    fn decode_line(&self, line: &str, out: &mut Vec<Result<StreamEvent, RelayError>>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let mut chunk: OllamaChatChunk = match serde_json::from_str(line) {
            Ok(c) => c,
            Err(e) => {
                out.push(Err(RelayError::UpstreamProtocolError(format!(
                    "failed to parse Ollama chunk: {e}"
                ))));
                return;
            }
        };

        if let Some(err) = chunk.error.take() {
            out.push(Err(classify_error(err)));
            return;
        }

        let content = chunk
            .message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        if !content.is_empty() {
            let mut metadata = Metadata::new();
            metadata.insert("model".into(), json!(self.model));
            out.push(Ok(StreamEvent::Partial {
                content: content.to_string(),
                metadata,
            }));
        }

        if chunk.done {
            out.push(Ok(StreamEvent::Done {
                metadata: chunk.done_metadata(&self.model),
            }));
        }
    }
}

impl Decoder for NdjsonDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, RelayError>> {
        let mut out = Vec::new();
        for line in self.lines.push(chunk) {
            match line {
                Ok(line) => self.decode_line(&line, &mut out),
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<Result<StreamEvent, RelayError>> {
        let mut out = Vec::new();
        match self.lines.finish() {
            Some(Ok(line)) => self.decode_line(&line, &mut out),
            Some(Err(e)) => out.push(Err(e)),
            None => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &[&[u8]]) -> Vec<Result<StreamEvent, RelayError>> {
        let mut d = NdjsonDecoder::new("llama3.2".into());
        let mut out = Vec::new();
        for chunk in input {
            out.extend(d.push(chunk));
        }
        out.extend(d.finish());
        out
    }

    #[test]
    fn partials_then_done_with_usage() {
        let out = decode(&[
            br#"{"model":"llama3.2","message":{"role":"assistant","content":"Hel"},"done":false}"#,
            b"\n",
            br#"{"model":"llama3.2","message":{"role":"assistant","content":"lo"},"done":false}
{"model":"llama3.2","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":4,"eval_count":2,"eval_duration":100}
"#,
        ]);
        let out: Vec<StreamEvent> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], StreamEvent::Partial { content, .. } if content == "Hel"));
        assert!(matches!(&out[1], StreamEvent::Partial { content, .. } if content == "lo"));
        let StreamEvent::Done { metadata } = &out[2] else {
            panic!("expected done, got {:?}", out[2]);
        };
        assert_eq!(metadata["done_reason"], "stop");
        assert_eq!(Usage::from_metadata(metadata), Some(Usage::new(4, 2)));
    }

    #[test]
    fn error_line_naming_missing_model_is_invalid_model() {
        let out = decode(&[br#"{"error":"model \"nope\" not found, try pulling it first"}"#]);
        assert!(matches!(out[0], Err(RelayError::InvalidModel(_))));
    }

    #[test]
    fn garbage_line_is_protocol_error() {
        let out = decode(&[b"not json\n"]);
        assert!(matches!(out[0], Err(RelayError::UpstreamProtocolError(_))));
    }

    #[test]
    fn chat_body_carries_options() {
        let mut req = ChatRequest::new("ollama", "llama3.2", "hi");
        req.max_tokens = Some(64);
        req.system_prompt = Some("be brief".into());
        let body = serde_json::to_value(OllamaProvider::chat_body(&req, true)).unwrap();
        assert_eq!(body["options"]["num_predict"], 64);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["stream"], true);
    }
}
