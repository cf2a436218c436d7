use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use digime_backend::config::AppConfig;
use digime_backend::runtime::{self, RunMode};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Run the auto-reply loop only.
    Bot,
    /// Serve the dashboard only (no manual send).
    Dashboard,
    /// Run the loop and serve the dashboard with live events.
    Both,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Bot => RunMode::Bot,
            Mode::Dashboard => RunMode::Dashboard,
            Mode::Both => RunMode::Both,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "digime", about = "Replies to approved WhatsApp contacts in your own style")]
struct Cli {
    #[arg(value_enum, default_value_t = Mode::Bot)]
    mode: Mode,

    /// Dashboard bind host (overrides DASHBOARD_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Dashboard bind port (overrides DASHBOARD_PORT).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,digime=debug,digime_backend=debug")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load()?;
    if let Some(host) = cli.host {
        config.dashboard_host = host;
    }
    if let Some(port) = cli.port {
        config.dashboard_port = port;
    }

    let bind_addr = format!("{}:{}", config.dashboard_host, config.dashboard_port)
        .parse::<SocketAddr>()
        .context("Invalid dashboard bind address (expected host:port)")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                // Hold stop_tx; a dropped sender reads as a stop request downstream.
                tracing::error!("Cannot listen for Ctrl-C ({}); running until killed", e);
                std::future::pending::<()>().await;
            }
        }
    });

    tracing::info!("digi.Me starting in {:?} mode", cli.mode);
    runtime::run(config, cli.mode.into(), bind_addr, stop_rx).await
}
