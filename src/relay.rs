//! The streaming relay: one client request bridged to one adapter call.

use crate::error::RelayError;
use crate::provider::{
    ChatRequest, ChatResponse, EventStream, Metadata, ModelInfo, Provider, ProviderHealth,
    ProviderKind, ProviderRegistry, StreamControl, StreamEvent, Usage,
};
use futures_core::Stream;
use futures_util::future::join_all;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Timing bounds applied by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Longest wait for upstream bytes, while opening a stream and between
    /// body reads.
    pub idle_timeout: Duration,
    /// Bound on a native non-streaming completion.
    pub request_timeout: Duration,
    /// Bound on each provider's health check.
    pub health_timeout: Duration,
    /// Bound on one provider's model listing.
    pub models_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(120),
            health_timeout: Duration::from_secs(5),
            models_timeout: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of one relayed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Result of [`Relay::relay`], depending on `ChatRequest::stream`.
pub enum RelayOutput {
    Stream(RelayStream),
    Complete(ChatResponse),
}

#[derive(Debug, Clone)]
pub struct Relay {
    registry: Arc<ProviderRegistry>,
    options: RelayOptions,
}

impl Relay {
    pub fn new(registry: ProviderRegistry, options: RelayOptions) -> Self {
        Self {
            registry: Arc::new(registry),
            options,
        }
    }

    fn select(&self, provider: &str) -> Result<(ProviderKind, Arc<dyn Provider>), RelayError> {
        let kind: ProviderKind = provider.parse()?;
        let adapter = self
            .registry
            .get(kind)
            .ok_or_else(|| RelayError::UnknownProvider(format!("{kind} is not configured")))?;
        Ok((kind, Arc::clone(adapter)))
    }

    pub async fn relay(&self, req: ChatRequest) -> Result<RelayOutput, RelayError> {
        if req.stream {
            self.stream(req).await.map(RelayOutput::Stream)
        } else {
            self.complete(req).await.map(RelayOutput::Complete)
        }
    }

    /// Open a relayed event stream.
    ///
    /// Fails only for an unknown provider or an invalid request, before any
    /// adapter is contacted. Every later failure arrives as the stream's
    /// terminal `Error` event.
    pub async fn stream(&self, req: ChatRequest) -> Result<RelayStream, RelayError> {
        let (kind, adapter) = self.select(&req.provider)?;
        req.validate()?;

        let model = req.model.clone();
        let cancel = CancellationToken::new();
        tracing::debug!(provider = %kind, %model, "relaying stream");

        let ctl = StreamControl {
            cancel: cancel.child_token(),
            idle_timeout: self.options.idle_timeout,
        };
        let started =
            tokio::time::timeout(self.options.idle_timeout, adapter.stream_chat(req, ctl)).await;

        let mut stream = RelayStream::new(kind, model, cancel);
        match started {
            Ok(Ok(inner)) => stream.inner = Some(inner),
            Ok(Err(err)) => stream.queued = Some(err.into()),
            Err(_) => {
                stream.queued = Some(
                    RelayError::UpstreamUnreachable(format!(
                        "{kind} did not respond within {:?}",
                        self.options.idle_timeout
                    ))
                    .into(),
                )
            }
        }
        Ok(stream)
    }

    /// Run a request to completion and return the whole answer.
    pub async fn complete(&self, req: ChatRequest) -> Result<ChatResponse, RelayError> {
        let (kind, adapter) = self.select(&req.provider)?;
        req.validate()?;

        if let Some(call) = adapter.complete(&req) {
            tracing::debug!(provider = %kind, model = %req.model, "native completion");
            return match tokio::time::timeout(self.options.request_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::UpstreamUnreachable(format!(
                    "{kind} did not complete within {:?}",
                    self.options.request_timeout
                ))),
            };
        }

        let model = req.model.clone();
        let mut stream = self.stream(req).await?;
        let mut message = String::new();
        let mut metadata = Metadata::new();

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Partial { content, metadata: m } => {
                    message.push_str(&content);
                    metadata.extend(m);
                }
                StreamEvent::Done { metadata: m } => metadata.extend(m),
                StreamEvent::Error { kind, message } => {
                    return Err(RelayError::from_kind(kind, message));
                }
            }
        }

        let usage = Usage::from_metadata(&metadata);
        metadata.remove("usage");

        Ok(ChatResponse {
            message,
            model,
            provider: kind,
            usage,
            metadata,
        })
    }

    /// Models offered by one provider. Adapter failures yield an empty list.
    pub async fn list_models(&self, provider: &str) -> Result<Vec<ModelInfo>, RelayError> {
        let (kind, adapter) = self.select(provider)?;

        match tokio::time::timeout(self.options.models_timeout, adapter.list_models()).await {
            Ok(Ok(models)) => Ok(models),
            Ok(Err(err)) => {
                tracing::warn!(provider = %kind, error = %err, "model listing failed");
                Ok(Vec::new())
            }
            Err(_) => {
                tracing::warn!(provider = %kind, "model listing timed out");
                Ok(Vec::new())
            }
        }
    }

    /// Reachability of every registered provider, checked concurrently.
    pub async fn check_health(&self) -> ProviderHealth {
        let timeout = self.options.health_timeout;
        let checks = self.registry.iter().map(|(kind, adapter)| {
            let check = adapter.health();
            async move {
                let ok = match tokio::time::timeout(timeout, check).await {
                    Ok(Ok(ok)) => ok,
                    Ok(Err(err)) => {
                        tracing::debug!(provider = %kind, error = %err, "health check failed");
                        false
                    }
                    Err(_) => {
                        tracing::debug!(provider = %kind, "health check timed out");
                        false
                    }
                };
                (kind.as_str().to_string(), ok)
            }
        });

        join_all(checks).await.into_iter().collect()
    }
}

/// A relayed event stream.
///
/// Yields zero or more `Partial` events and then exactly one `Done` or
/// `Error`, unless it is cancelled first. Dropping the stream or calling
/// [`RelayStream::cancel`] cancels the upstream call.
pub struct RelayStream {
    provider: ProviderKind,
    model: String,
    inner: Option<EventStream>,
    /// Terminal event decided before any upstream data.
    queued: Option<StreamEvent>,
    state: RequestState,
    forwarded: usize,
    cancel: CancellationToken,
}

impl RelayStream {
    fn new(provider: ProviderKind, model: String, cancel: CancellationToken) -> Self {
        Self {
            provider,
            model,
            inner: None,
            queued: None,
            state: RequestState::Pending,
            forwarded: 0,
            cancel,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Partial events forwarded so far.
    pub fn forwarded(&self) -> usize {
        self.forwarded
    }

    /// Stop relaying. No terminal event is produced afterwards.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::debug!(
            provider = %self.provider,
            model = %self.model,
            events = self.forwarded,
            "relay stream cancelled"
        );
        self.state = RequestState::Cancelled;
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        self.inner = None;
        self.queued = None;
    }

    fn finish(&mut self, event: StreamEvent) -> StreamEvent {
        match &event {
            StreamEvent::Error { kind, message } => {
                self.state = RequestState::Failed;
                tracing::warn!(
                    provider = %self.provider,
                    model = %self.model,
                    events = self.forwarded,
                    ?kind,
                    error = %message,
                    "relay stream failed"
                );
            }
            _ => {
                self.state = RequestState::Completed;
                tracing::info!(
                    provider = %self.provider,
                    model = %self.model,
                    events = self.forwarded,
                    "relay stream completed"
                );
            }
        }
        self.shutdown();
        event
    }
}

impl Stream for RelayStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        if this.state.is_terminal() {
            return Poll::Ready(None);
        }
        if let Some(event) = this.queued.take() {
            return Poll::Ready(Some(this.finish(event)));
        }
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(event)) if event.is_terminal() => Poll::Ready(Some(this.finish(event))),
            Poll::Ready(Some(event)) => {
                this.state = RequestState::Streaming;
                this.forwarded += 1;
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                tracing::debug!(provider = %this.provider, "upstream ended without a terminal event");
                Poll::Ready(Some(this.finish(StreamEvent::done())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        self.cancel();
    }
}
