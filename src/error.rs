use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by the relay, the adapters and the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Client-supplied data is malformed. Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported provider: {0}")]
    UnknownProvider(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("authentication missing: {0}")]
    AuthenticationMissing(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),
}

/// Serializable tag for a [`RelayError`], carried by terminal error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    UnknownProvider,
    UpstreamUnreachable,
    AuthenticationMissing,
    InvalidModel,
    UpstreamProtocolError,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::UnknownProvider(_) => ErrorKind::UnknownProvider,
            Self::UpstreamUnreachable(_) => ErrorKind::UpstreamUnreachable,
            Self::AuthenticationMissing(_) => ErrorKind::AuthenticationMissing,
            Self::InvalidModel(_) => ErrorKind::InvalidModel,
            Self::UpstreamProtocolError(_) => ErrorKind::UpstreamProtocolError,
        }
    }

    /// The bare detail text, without the kind prefix added by `Display`.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidRequest(m)
            | Self::UnknownProvider(m)
            | Self::UpstreamUnreachable(m)
            | Self::AuthenticationMissing(m)
            | Self::InvalidModel(m)
            | Self::UpstreamProtocolError(m) => m,
        }
    }

    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::InvalidRequest => Self::InvalidRequest(message),
            ErrorKind::UnknownProvider => Self::UnknownProvider(message),
            ErrorKind::UpstreamUnreachable => Self::UpstreamUnreachable(message),
            ErrorKind::AuthenticationMissing => Self::AuthenticationMissing(message),
            ErrorKind::InvalidModel => Self::InvalidModel(message),
            ErrorKind::UpstreamProtocolError => Self::UpstreamProtocolError(message),
        }
    }

    /// True for errors caused by the caller rather than by an upstream provider.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::UnknownProvider(_))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::UpstreamProtocolError(err.to_string())
        } else {
            Self::UpstreamUnreachable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::UpstreamProtocolError(err.to_string())
    }
}
