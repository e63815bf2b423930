//! Streaming chat relay between a browser chat client and LLM providers.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod paths;
pub mod provider;
pub mod relay;
pub mod server;

pub use error::{ErrorKind, RelayError};
pub use relay::{Relay, RelayOptions, RelayOutput, RelayStream, RequestState};
