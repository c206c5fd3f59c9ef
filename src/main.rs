use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_sentinel::{
    api_client::MediaProxyClient, checker::StreamChecker, config::Config, probe::FfmpegProber,
};

#[derive(Parser)]
#[command(name = "stream-sentinel")]
#[command(version)]
#[command(about = "Stream quality checking and ordering service for IPTV media proxies")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Media proxy base URL (overrides config file)
    #[arg(short = 'u', long, value_name = "URL")]
    base_url: Option<String>,

    /// Media proxy API token (overrides config file)
    #[arg(short = 't', long, value_name = "TOKEN")]
    token: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("stream_sentinel={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting stream-sentinel v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config.display());

    if let Some(base_url) = cli.base_url {
        config.api.base_url = base_url;
    }
    if let Some(token) = cli.token {
        config.api.token = Some(token);
    }
    info!("Using media proxy at {}", config.api.base_url);

    let prober = FfmpegProber::new();
    prober.ensure_tools().await?;
    info!("ffmpeg and ffprobe are available");

    let api = MediaProxyClient::new(&config.api);
    let service = Arc::new(StreamChecker::new(
        config,
        cli.config,
        Arc::new(api),
        Arc::new(prober),
    ));

    service.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    service.stop().await;

    Ok(())
}
