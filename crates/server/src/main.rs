use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

mod config;

use config::{ServerConfig, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "MCP server exposing tools over stdio, HTTP and WebSocket", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "switchboard.toml", env = "SWITCHBOARD_CONFIG")]
    config: PathBuf,

    /// Serve a single transport instead of the configured ones
    #[arg(short, long, value_enum, env = "SWITCHBOARD_TRANSPORT")]
    transport: Option<TransportKind>,

    /// Listener address for HTTP/WebSocket transports
    #[arg(short, long, env = "SWITCHBOARD_BIND")]
    bind: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    // stdout carries protocol messages for the stdio transport
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info,switchboard_mcp=info,switchboard_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Text => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    tracing::info!("Starting Switchboard MCP server");

    // Load configuration
    let mut config = ServerConfig::load(&args.config)?;
    config.apply_overrides(args.transport, args.bind)?;
    if let Some(source) = &config.source {
        tracing::info!(path = %source.display(), "Loaded configuration");
    }

    let server = config.build_server()?;
    server.start().await.context("Failed to start MCP server")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    server.stop().await.context("Failed to stop MCP server")?;
    Ok(())
}
