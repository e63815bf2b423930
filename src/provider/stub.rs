//! In-process provider that replays a fixed script, for tests.

use super::{ChatRequest, EventStream, ModelInfo, Provider, ProviderKind, StreamControl, StreamEvent};
use crate::error::{ErrorKind, RelayError};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone)]
pub enum Step {
    Partial(String),
    Done,
    Fail(ErrorKind, String),
    /// Go quiet without closing the stream.
    Stall(Duration),
}

#[derive(Debug, Default)]
struct Probe {
    calls: AtomicUsize,
    cancelled: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct StubProvider {
    kind: ProviderKind,
    script: Vec<Step>,
    delay: Duration,
    start_error: Option<RelayError>,
    models: Vec<ModelInfo>,
    healthy: Result<bool, RelayError>,
    probe: Arc<Probe>,
}

impl StubProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            script: Vec::new(),
            delay: Duration::ZERO,
            start_error: None,
            models: Vec::new(),
            healthy: Ok(true),
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn script(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script = steps.into_iter().collect();
        self
    }

    /// Pause before every step and before answering a model listing.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the call itself instead of producing a stream.
    pub fn fail_start(mut self, err: RelayError) -> Self {
        self.start_error = Some(err);
        self
    }

    pub fn models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = models;
        self
    }

    pub fn health_result(mut self, healthy: Result<bool, RelayError>) -> Self {
        self.healthy = healthy;
        self
    }

    /// Number of `stream_chat` invocations so far.
    pub fn calls(&self) -> usize {
        self.probe.calls.load(Ordering::SeqCst)
    }

    /// Whether a running script observed its cancellation token.
    pub fn was_cancelled(&self) -> bool {
        self.probe.cancelled.load(Ordering::SeqCst)
    }
}

impl Provider for StubProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn stream_chat(
        &self,
        req: ChatRequest,
        ctl: StreamControl,
    ) -> BoxFuture<'static, Result<EventStream, RelayError>> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();

        Box::pin(async move {
            let StubProvider {
                script,
                delay,
                start_error,
                probe,
                ..
            } = this;
            if let Some(err) = start_error {
                return Err(err);
            }
            tracing::debug!(model = %req.model, steps = script.len(), "stub stream started");

            let (tx, rx) = mpsc::channel::<StreamEvent>(32);

            tokio::spawn(async move {
                for step in script {
                    let pause = match &step {
                        Step::Stall(d) => delay + *d,
                        _ => delay,
                    };
                    // Each step stands in for one upstream chunk.
                    let silent = tokio::select! {
                        _ = ctl.cancel.cancelled() => {
                            probe.cancelled.store(true, Ordering::SeqCst);
                            return;
                        }
                        waited = tokio::time::timeout(ctl.idle_timeout, tokio::time::sleep(pause)) => waited.is_err(),
                    };
                    if silent {
                        let err = RelayError::UpstreamUnreachable(format!(
                            "no data from stub for {:?}",
                            ctl.idle_timeout
                        ));
                        let _ = tx.send(err.into()).await;
                        return;
                    }

                    let event = match step {
                        Step::Partial(text) => StreamEvent::partial(text),
                        Step::Done => StreamEvent::done(),
                        Step::Fail(kind, message) => StreamEvent::Error { kind, message },
                        Step::Stall(_) => continue,
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as EventStream)
        })
    }

    fn list_models(&self) -> BoxFuture<'static, Result<Vec<ModelInfo>, RelayError>> {
        let models = self.models.clone();
        let healthy = self.healthy.clone();
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            healthy.map(|_| models)
        })
    }

    fn health(&self) -> BoxFuture<'static, Result<bool, RelayError>> {
        let healthy = self.healthy.clone();
        Box::pin(async move { healthy })
    }
}
