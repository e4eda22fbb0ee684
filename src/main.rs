use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hiwar_engine::Assistant;
use hiwar_llm::{OpenAiCompatProvider, ProviderConfig};
use hiwar_store::ConversationStore;
use hiwar_telemetry::TelemetryConfig;

/// Arabic chat assistant relayed over WebSocket.
#[derive(Debug, Parser)]
#[command(name = "hiwar", version)]
struct Args {
    /// Bearer token for the completion endpoint.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Base URL of the OpenAI-compatible API.
    #[arg(long, env = "HIWAR_BASE_URL", default_value = hiwar_llm::openai::DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long, env = "HIWAR_MODEL", default_value = hiwar_llm::openai::DEFAULT_MODEL)]
    model: String,

    #[arg(long, env = "HIWAR_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "HIWAR_PORT", default_value_t = 8000)]
    port: u16,

    /// Directory served under /static.
    #[arg(long, default_value = "static")]
    static_dir: PathBuf,

    #[arg(long, default_value = "chatbot.log")]
    log_file: PathBuf,

    /// Disable the log file.
    #[arg(long)]
    no_log_file: bool,

    /// Emit JSON log lines on stdout.
    #[arg(long)]
    json_logs: bool,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _telemetry = hiwar_telemetry::init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        json: args.json_logs,
        log_file: (!args.no_log_file).then(|| args.log_file.clone()),
        ..Default::default()
    });

    anyhow::ensure!(!args.api_key.trim().is_empty(), "OPENAI_API_KEY is empty");

    let provider = OpenAiCompatProvider::new(
        ProviderConfig::new(args.api_key)
            .with_base_url(args.base_url)
            .with_model(args.model),
    );
    tracing::info!(endpoint = provider.endpoint(), "Completion provider configured");

    let assistant = Arc::new(Assistant::new(Arc::new(provider), Arc::new(ConversationStore::new())));

    let config = hiwar_server::ServerConfig {
        host: args.host,
        port: args.port,
        static_dir: args.static_dir,
        ..Default::default()
    };
    let handle = hiwar_server::start(config, assistant)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "Hiwar ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
