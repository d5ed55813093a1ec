//! Braid tunnel daemon
//!
//! One process runs one endpoint of the tunnel; the configuration file
//! decides whether it dials (initiator) or listens (responder). The
//! process exits cleanly on SIGINT or SIGTERM.

use anyhow::{Context, Result};
use braid::config::{Config, Mode};
use braid::{Initiator, Responder};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Braid - layer-3 VPN over a pool of authenticated TLS connections
#[derive(Parser, Debug)]
#[command(name = "braid")]
#[command(about = "Layer-3 VPN multiplexing IP packets over a pool of TLS connections")]
#[command(version)]
struct Args {
    /// Configuration file path
    config: std::path::PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        "braid v{} starting as {} (tunnel {})",
        braid::VERSION,
        config.mode,
        config.id
    );

    match config.mode {
        Mode::Initiator => {
            let endpoint = Initiator::start(&config)
                .await
                .context("Failed to start initiator")?;
            wait_for_signal().await?;
            info!("Shutting down...");
            endpoint.shutdown().await;
        }
        Mode::Responder => {
            let endpoint = Responder::start(&config)
                .await
                .context("Failed to start responder")?;
            wait_for_signal().await?;
            info!("Shutting down...");
            endpoint.shutdown().await;
        }
    }

    Ok(())
}

/// Block until SIGINT or SIGTERM arrives.
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for ctrl-c")?;

    Ok(())
}
