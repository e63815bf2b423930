//! Byte-level plumbing shared by the HTTP adapters: line framing, a minimal
//! SSE parser, status mapping and the pump task that turns a response body
//! into an [`EventStream`].

use super::{EventStream, ProviderKind, StreamControl, StreamEvent};
use crate::error::RelayError;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Turns raw body chunks into normalized events.
///
/// Implementations keep only the bytes of the upstream chunk currently being
/// framed; everything complete is returned immediately.
pub(crate) trait Decoder: Send + 'static {
    fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, RelayError>>;

    /// Called once at end of body, for a trailing record with no newline.
    fn finish(&mut self) -> Vec<Result<StreamEvent, RelayError>> {
        Vec::new()
    }
}

/// Splits a byte stream into `\n` / `\r\n` terminated UTF-8 lines.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, RelayError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            out.push(into_utf8(line));
        }

        out
    }

    /// Remaining bytes after the body ended without a final newline.
    pub(crate) fn finish(&mut self) -> Option<Result<String, RelayError>> {
        if self.buf.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.ends_with(b"\r") {
            line.pop();
        }
        Some(into_utf8(line))
    }
}

fn into_utf8(line: Vec<u8>) -> Result<String, RelayError> {
    String::from_utf8(line)
        .map_err(|e| RelayError::UpstreamProtocolError(format!("line is not valid UTF-8: {e}")))
}

/// Minimal SSE parser.
///
/// - Collects `data:` fields
/// - Emits the joined data when a blank line ends an event
/// - Ignores `event:`, `id:`, `retry:` and comments
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    lines: LineBuffer,
    cur_data: Option<String>,
}

impl SseParser {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, RelayError>> {
        let mut out = Vec::new();
        for line in self.lines.push(chunk) {
            match line {
                Ok(line) => self.feed(&line, &mut out),
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    pub(crate) fn finish(&mut self) -> Vec<Result<String, RelayError>> {
        let mut out = Vec::new();
        match self.lines.finish() {
            Some(Ok(line)) => self.feed(&line, &mut out),
            Some(Err(e)) => out.push(Err(e)),
            None => {}
        }
        if let Some(data) = self.cur_data.take() {
            out.push(Ok(data));
        }
        out
    }

    fn feed(&mut self, line: &str, out: &mut Vec<Result<String, RelayError>>) {
        if line.is_empty() {
            if let Some(data) = self.cur_data.take() {
                out.push(Ok(data));
            }
            return;
        }

        if let Some(rest) = line.strip_prefix("data:") {
            // Optional single leading space.
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            match self.cur_data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(rest);
                }
                None => self.cur_data = Some(rest.to_string()),
            }
        }
    }
}

/// Map a non-success upstream status to the error taxonomy.
pub(crate) fn error_for_status(provider: ProviderKind, status: StatusCode, body: &str) -> RelayError {
    let detail = format!("{provider} API error {status}: {}", body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RelayError::AuthenticationMissing(detail),
        StatusCode::NOT_FOUND => RelayError::InvalidModel(detail),
        s if s.is_server_error() => RelayError::UpstreamUnreachable(detail),
        _ => RelayError::UpstreamProtocolError(detail),
    }
}

/// Send a prepared request and fail on a non-success status.
pub(crate) async fn send(
    provider: ProviderKind,
    req: reqwest::RequestBuilder,
) -> Result<reqwest::Response, RelayError> {
    let resp = req.send().await.map_err(|e| {
        RelayError::UpstreamUnreachable(format!("failed to contact {provider}: {e}"))
    })?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(error_for_status(provider, status, &text));
    }
    Ok(resp)
}

/// Spawn the task that reads `resp` and forwards decoded events.
///
/// The task ends after the first terminal event, at end of body, when the
/// receiver is dropped, when `ctl.cancel` fires, or when no bytes arrive for
/// `ctl.idle_timeout`. Returning drops the response and with it the upstream
/// connection.
pub(crate) fn spawn_pump<D: Decoder>(
    provider: ProviderKind,
    resp: reqwest::Response,
    mut decoder: D,
    ctl: StreamControl,
) -> EventStream {
    let (tx, rx) = mpsc::channel::<StreamEvent>(64);

    tokio::spawn(async move {
        let mut body = Box::pin(resp.bytes_stream());

        loop {
            let next = tokio::select! {
                _ = ctl.cancel.cancelled() => {
                    tracing::debug!(%provider, "stream cancelled; closing upstream connection");
                    return;
                }
                next = tokio::time::timeout(ctl.idle_timeout, body.next()) => next,
            };

            // Any chunk counts as activity, even one that decodes to nothing.
            let Ok(next) = next else {
                let err = RelayError::UpstreamUnreachable(format!(
                    "no data from {provider} for {:?}",
                    ctl.idle_timeout
                ));
                let _ = tx.send(err.into()).await;
                return;
            };

            let decoded = match next {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(e)) => {
                    let err = RelayError::UpstreamUnreachable(format!("{provider} stream read failed: {e}"));
                    let _ = tx.send(err.into()).await;
                    return;
                }
                None => {
                    for item in decoder.finish() {
                        if !forward(&tx, item).await {
                            return;
                        }
                    }
                    return;
                }
            };

            for item in decoded {
                if !forward(&tx, item).await {
                    return;
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Returns false once nothing more may be sent.
async fn forward(tx: &mpsc::Sender<StreamEvent>, item: Result<StreamEvent, RelayError>) -> bool {
    let event = item.unwrap_or_else(StreamEvent::from);
    let terminal = event.is_terminal();
    tx.send(event).await.is_ok() && !terminal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks_and_crlf() {
        let mut lb = LineBuffer::default();
        assert!(lb.push(b"{\"a\":").is_empty());
        let lines: Vec<String> = lb
            .push(b"1}\r\n{\"b\":2}\n{\"c\"")
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(lb.finish().unwrap().unwrap(), "{\"c\"");
        assert!(lb.finish().is_none());
    }

    #[test]
    fn sse_joins_multiline_data_and_skips_other_fields() {
        let mut p = SseParser::default();
        let mut out = p.push(b": keep-alive\nevent: message\ndata: one\ndata:two\n\n");
        out.extend(p.push(b"data: [DONE]\n"));
        out.extend(p.finish());
        let out: Vec<String> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(out, vec!["one\ntwo", "[DONE]"]);
    }

    #[test]
    fn invalid_utf8_is_a_protocol_error() {
        let mut lb = LineBuffer::default();
        let out = lb.push(&[0xff, 0xfe, b'\n']);
        assert!(matches!(out[0], Err(RelayError::UpstreamProtocolError(_))));
    }

    #[test]
    fn status_mapping() {
        let p = ProviderKind::OpenAi;
        assert!(matches!(
            error_for_status(p, StatusCode::UNAUTHORIZED, ""),
            RelayError::AuthenticationMissing(_)
        ));
        assert!(matches!(
            error_for_status(p, StatusCode::NOT_FOUND, "model not found"),
            RelayError::InvalidModel(_)
        ));
        assert!(matches!(
            error_for_status(p, StatusCode::BAD_GATEWAY, ""),
            RelayError::UpstreamUnreachable(_)
        ));
        assert!(matches!(
            error_for_status(p, StatusCode::BAD_REQUEST, "bad"),
            RelayError::UpstreamProtocolError(_)
        ));
    }
}
