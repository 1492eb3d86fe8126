mod config;
mod dispatch;
mod mavlink;
mod session;
mod tracer;
mod transport;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::BridgeConfig;
use dispatch::BridgeServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// MAVLink bridge feeding synthetic simulator telemetry to SITL autopilots
#[derive(Debug, Parser)]
#[command(name = "sitl-bridge", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept autopilot connections and step their simulations
    Serve {
        /// Override the listening address
        #[arg(long)]
        listen: Option<String>,
    },
    /// Log simulator-related messages sent by an autopilot
    Trace {
        /// Override the tracer endpoint (mavlink connection string)
        #[arg(long)]
        listen: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(cli.log_level.into()))
        .init();

    let mut config = BridgeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { listen } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            serve(config).await
        }
        Command::Trace { listen } => {
            if let Some(listen) = listen {
                config.tracer.listen = listen;
            }
            trace(config).await
        }
    }
}

async fn serve(config: BridgeConfig) -> Result<()> {
    info!(
        listen = %config.listen,
        step_interval_ms = config.pacing.step_interval_ms,
        idle_ceiling_ms = config.pacing.idle_ceiling_ms,
        "SITL bridge starting"
    );

    let (server, events) = BridgeServer::connect(&config).await?;
    let server = Arc::new(server);

    let dispatcher = {
        let server = server.clone();
        tokio::spawn(async move { server.listen(events).await })
    };

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    warn!("Shutdown requested");

    server.close().await;
    dispatcher.await.context("dispatcher task")?;

    info!("SITL bridge stopped");
    Ok(())
}

async fn trace(config: BridgeConfig) -> Result<()> {
    let shutdown = CancellationToken::new();

    let mut tracer = {
        let shutdown = shutdown.clone();
        let address = config.tracer.listen.clone();
        tokio::spawn(async move { tracer::run(&address, shutdown).await })
    };

    tokio::select! {
        result = &mut tracer => return result.context("tracer task")?,
        result = tokio::signal::ctrl_c() => result.context("wait for Ctrl-C")?,
    }

    shutdown.cancel();
    tracer.await.context("tracer task")?
}
