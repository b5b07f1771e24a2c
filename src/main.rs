//! Audio Relay Server
//!
//! Real-time audio relay. Broadcasters stream binary frames into a channel and
//! the relay fans each frame out to every listener on that channel.

mod config;
mod relay;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{RelayConfig, Transport, CONFIG_FILE};
use server::RelayServer;

/// Audio Relay Server
///
/// Fans out audio frames from broadcasters to listeners per channel
#[derive(Parser, Debug)]
#[command(name = "audio-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Maximum listeners per channel
    #[arg(long)]
    max_listeners: Option<usize>,

    /// Transport to accept connections on
    #[arg(long, value_enum)]
    transport: Option<Transport>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Apply command-line overrides on top of the file configuration
    fn apply(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(bind) = &self.bind {
            config = config.with_bind(bind.clone());
        }
        if let Some(max_listeners) = self.max_listeners {
            config = config.with_max_listeners(max_listeners);
        }
        if let Some(transport) = self.transport {
            config = config.with_transport(transport);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Audio Relay v{}", env!("CARGO_PKG_VERSION"));

    let config = args.apply(RelayConfig::load(&args.config)?);
    config.validate()?;
    info!(
        "Max listeners per channel: {}, transport: {:?}",
        config.max_listeners, config.transport
    );

    let server = Arc::new(RelayServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Relay closed successfully");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
