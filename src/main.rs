use anyhow::Context;
use chat_relay::cli::{self, Command};
use chat_relay::config::Config;
use chat_relay::provider::ChatRequest;
use chat_relay::{app, paths};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional; real environment variables win.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = cli::Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => paths::config_path()?,
    };
    let mut cfg = Config::resolve(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    tracing::debug!(?config_path, ?cfg.server, ?cfg.relay, "resolved config");

    match args.cmd.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            app::cmd_serve(&cfg).await
        }
        Command::Chat {
            provider,
            model,
            system,
            no_stream,
            prompt,
        } => {
            let mut req = ChatRequest::new(provider, model, prompt.join(" "));
            req.system_prompt = system;
            req.stream = !no_stream;
            app::cmd_chat(&cfg, req).await
        }
        Command::Models { provider } => app::cmd_models(&cfg, &provider).await,
        Command::Health => app::cmd_health(&cfg).await,
    }
}
