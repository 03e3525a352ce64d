use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parley_config::{ConfigLoader, LogLevel};
use parley_observability::Observability;
use parley_server::{chat, run_server};

#[derive(Parser, Debug, Clone)]
#[command(name = "parley-server")]
#[command(about = "STOMP publish/subscribe relay over WebSocket and SockJS")]
#[command(version)]
struct Cli {
    /// Config file path (.json or .toml)
    #[arg(long, env = "PARLEY_CONFIG", default_value = "~/.parley/config.json")]
    config: String,

    /// Listen address (overrides config)
    #[arg(long, env = "PARLEY_HOST")]
    host: Option<String>,

    /// Listen port (overrides config)
    #[arg(long, env = "PARLEY_PORT")]
    port: Option<u16>,

    /// Allowed origin, repeatable (replaces the configured list)
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,

    /// Log level or filter directive (overrides config)
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Enable debug logging
    #[arg(long, env = "DEBUG", default_value = "false")]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = parley_config::expand_tilde(&cli.config)
        .unwrap_or_else(|| PathBuf::from(&cli.config));
    let mut config = ConfigLoader::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if !cli.allowed_origins.is_empty() {
        config.broker.allowed_origins = cli.allowed_origins;
    }
    if cli.debug {
        config.logging.level = LogLevel::Debug;
    }
    ConfigLoader::validate(&config).context("Invalid configuration")?;

    let log_level = match (cli.debug, cli.log_level) {
        (false, Some(level)) => level,
        _ => config.logging.level.to_string(),
    };
    let mut observability_config = parley_observability::Config::default()
        .with_log_level(log_level)
        .with_json_format(config.logging.json);
    if let Some(file) = config.logging.file.as_deref().and_then(parley_config::expand_tilde) {
        observability_config = observability_config.with_log_file(file);
    }
    let observability = Observability::init(observability_config)?;

    tracing::info!("Config loaded from {:?}", config_path);
    tracing::info!("Broker configuration:");
    tracing::info!("  Endpoint: {}", config.broker.endpoint);
    tracing::info!("  Broadcast prefix: {}", config.broker.broadcast_prefix);
    tracing::info!("  Application prefix: {}", config.broker.application_prefix);
    tracing::info!("  Allowed origins: {:?}", config.broker.allowed_origins);
    tracing::info!(
        "  Transports: websocket={} fallback={}",
        config.transport.websocket_enabled,
        config.transport.fallback_enabled
    );
    tracing::debug!("  Max sessions: {}", config.broker.max_sessions);
    tracing::debug!("  Max frame bytes: {}", config.broker.max_frame_bytes);
    tracing::debug!("  Heart-beat: {:?}", config.broker.heartbeat);

    let handlers = chat::handlers().context("Failed to register chat handlers")?;
    let result = run_server(
        Arc::new(config),
        handlers,
        observability.metrics(),
        shutdown_signal(),
    )
    .await;

    observability.shutdown();
    result
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await
        }
    }
}
