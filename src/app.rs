use crate::config::Config;
use crate::provider::{self, ChatRequest, ProviderRegistry, StreamEvent};
use crate::relay::Relay;
use crate::server;
use anyhow::Context;
use std::io::Write;
use std::sync::Arc;
use tokio_stream::StreamExt;

pub fn build_http(cfg: &Config) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(cfg.connect_timeout())
        .build()
        .context("failed to build HTTP client")
}

/// Register one adapter per enabled provider. Missing API keys do not stop
/// registration; those providers report `AuthenticationMissing` when used.
pub fn build_registry(http: &reqwest::Client, cfg: &Config) -> anyhow::Result<ProviderRegistry> {
    let registry = ProviderRegistry::new();

    #[cfg(feature = "ollama")]
    let registry = registry.with(Arc::new(provider::ollama::OllamaProvider::new(
        http.clone(),
        &cfg.ollama.base_url,
    )?));

    #[cfg(feature = "openai")]
    let registry = registry.with(Arc::new(provider::openai::OpenAiCompatProvider::openai(
        http.clone(),
        cfg.openai
            .base_url
            .as_deref()
            .unwrap_or(provider::openai::DEFAULT_BASE_URL),
        cfg.openai.api_key.clone(),
    )?));

    #[cfg(feature = "perplexity")]
    let registry = registry.with(Arc::new(provider::perplexity::PerplexityProvider::new(
        http.clone(),
        cfg.perplexity
            .base_url
            .as_deref()
            .unwrap_or(provider::perplexity::DEFAULT_BASE_URL),
        cfg.perplexity.api_key.clone(),
    )?));

    #[cfg(not(any(feature = "ollama", feature = "openai", feature = "perplexity")))]
    let _ = (http, cfg);
    tracing::debug!(providers = ?registry, "provider registry built");
    Ok(registry)
}

pub fn build_relay(cfg: &Config) -> anyhow::Result<Relay> {
    let http = build_http(cfg)?;
    let registry = build_registry(&http, cfg)?;
    Ok(Relay::new(registry, cfg.relay_options()))
}

pub async fn cmd_serve(cfg: &Config) -> anyhow::Result<()> {
    let relay = build_relay(cfg)?;
    let addr = cfg.bind_addr()?;
    server::serve(relay, &cfg.server, addr)
        .await
        .context("gateway stopped with an error")
}

pub async fn cmd_chat(cfg: &Config, req: ChatRequest) -> anyhow::Result<()> {
    let relay = build_relay(cfg)?;
    let mut out = std::io::stdout();

    if !req.stream {
        let resp = relay.complete(req).await.context("chat failed")?;
        writeln!(out, "{}", resp.message)?;
        if let Some(usage) = resp.usage {
            tracing::info!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "usage"
            );
        }
        return Ok(());
    }

    let mut stream = relay.stream(req).await.context("relay refused the request")?;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Partial { content, .. } => {
                write!(out, "{content}")?;
                out.flush().ok();
            }
            StreamEvent::Done { .. } => break,
            StreamEvent::Error { kind, message } => {
                writeln!(out)?;
                anyhow::bail!("stream failed ({kind:?}): {message}");
            }
        }
    }
    writeln!(out)?;
    Ok(())
}

pub async fn cmd_models(cfg: &Config, provider_name: &str) -> anyhow::Result<()> {
    let relay = build_relay(cfg)?;
    let models = relay.list_models(provider_name).await?;
    if models.is_empty() {
        println!("(no models available from {provider_name})");
        return Ok(());
    }
    for m in &models {
        println!(
            "{}\t{}",
            m.name,
            m.size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

pub async fn cmd_health(cfg: &Config) -> anyhow::Result<()> {
    let relay = build_relay(cfg)?;
    for (name, ok) in relay.check_health().await {
        println!("{}\t{name}", if ok { "up" } else { "down" });
    }
    Ok(())
}
