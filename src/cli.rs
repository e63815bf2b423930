use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Chat relay gateway for Ollama, OpenAI and Perplexity
#[derive(Debug, Parser)]
#[command(name = "chat-relay")]
#[command(version)]
#[command(about = "Chat relay gateway for local and hosted LLM providers", long_about = None)]
pub struct Args {
    /// Config file (default: <config dir>/config.toml)
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP gateway (default)
    Serve {
        /// Listen host (overrides config and HOST)
        #[arg(long = "host")]
        host: Option<String>,

        /// Listen port (overrides config and PORT)
        #[arg(long = "port")]
        port: Option<u16>,
    },

    /// Send one prompt through the relay and print the answer
    Chat {
        /// Provider name
        #[arg(short = 'p', long = "provider", default_value = "ollama")]
        provider: String,

        /// Model name
        #[arg(short = 'm', long = "model", default_value = "llama3.2")]
        model: String,

        /// System prompt
        #[arg(long = "system")]
        system: Option<String>,

        /// Wait for the whole answer instead of streaming tokens
        #[arg(long = "no-stream")]
        no_stream: bool,

        /// Prompt text
        #[arg(value_name = "PROMPT", required = true)]
        prompt: Vec<String>,
    },

    /// List models offered by a provider
    Models {
        #[arg(short = 'p', long = "provider", default_value = "ollama")]
        provider: String,
    },

    /// Check which providers are reachable
    Health,
}
