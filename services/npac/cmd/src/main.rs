//! NPAC gateway adapter binary.
//!
//! Opens one gateway session per configured primary SPID, keeps every
//! required region association connected and recovered, and logs the
//! notifications the gateway delivers.

use clap::Parser;
use npac_adapter::{ComServer, NpacAdapter, SystemClock};
use npac_storage::Storage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod driver;
mod logging;
mod transport;

use config::GatewayConfig;
use driver::LoggingDriverChain;
use logging::NpacLogFormatter;
use transport::TcpGatewayClient;

/// NPAC/OSS gateway adapter
#[derive(Parser, Debug)]
#[command(name = "npac-gateway", version, about = "NPAC/OSS gateway adapter")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Gateway address, e.g. 10.0.0.5:7400
    #[arg(long)]
    gateway: Option<String>,

    /// Delay before failed requests are retried, e.g. 30s
    #[arg(long)]
    retry_interval: Option<humantime::Duration>,

    /// Reply timeout before a request is resent, e.g. 2m
    #[arg(long)]
    resend_timeout: Option<humantime::Duration>,

    /// Recovery window width, e.g. 1h
    #[arg(long)]
    recovery_window: Option<humantime::Duration>,

    /// Keep-alive period, e.g. 60s (0s disables keep-alives)
    #[arg(long)]
    keep_alive_interval: Option<humantime::Duration>,

    /// Storage mode: memory, file
    #[arg(long)]
    storage_mode: Option<String>,

    /// Snapshot path for file storage
    #[arg(long)]
    storage_path: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(gateway) = &self.gateway {
            config.gateway_addr = gateway.clone();
        }
        if let Some(interval) = self.retry_interval {
            config.retry_interval = interval.into();
        }
        if let Some(timeout) = self.resend_timeout {
            config.resend_timeout = timeout.into();
        }
        if let Some(window) = self.recovery_window {
            config.recovery_window = window.into();
        }
        if let Some(interval) = self.keep_alive_interval {
            config.keep_alive_interval = interval.into();
        }
        if let Some(mode) = &self.storage_mode {
            config.storage_mode = mode.to_lowercase();
        }
        if let Some(path) = &self.storage_path {
            config.storage_path = path.clone();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("npac_gateway={}", args.log_level).parse()?)
        .add_directive(format!("npac_adapter={}", args.log_level).parse()?)
        .add_directive(format!("npac_session={}", args.log_level).parse()?)
        .add_directive(format!("npac_storage={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(NpacLogFormatter::new("npac"))
        .init();

    info!("Starting NPAC gateway adapter v{}", env!("CARGO_PKG_VERSION"));

    let mut config = GatewayConfig::load_from_file(&args.config)?;
    args.apply(&mut config);

    let registry = config.build_registry()?;
    let storage = Storage::from_mode(config.storage_mode()?).await?;
    let client = Arc::new(TcpGatewayClient::new(config.gateway_addr.clone()));

    let adapter = NpacAdapter::new(
        config.adapter_config(),
        registry,
        storage,
        client.clone(),
        Arc::new(LoggingDriverChain::default()),
        Arc::new(SystemClock),
    );
    let server = Arc::new(ComServer::new(adapter));

    let transport_task = tokio::spawn(client.run(server.clone()));
    server.start().await;
    info!("NPAC gateway adapter started. Waiting for events...");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM signal, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT signal, shutting down"),
    }

    // release sessions while the connection is still up
    server.shutdown().await;
    transport_task.abort();

    info!("NPAC gateway adapter shutdown complete");
    Ok(())
}
