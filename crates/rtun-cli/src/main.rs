//! rtun — reverse-tunnel client CLI.
//!
//! Connects to a tunnel server, requests public HTTP/HTTPS endpoints and
//! relays every connection made to them to a service on this machine.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{FileConfig, Overrides};
use rtun_client::ControlSession;

/// rtun — expose local HTTP/HTTPS services through a tunnel server
#[derive(Parser, Debug)]
#[command(name = "rtun", version, about = "Reverse-tunnel client: expose local HTTP/HTTPS services through a tunnel server")]
struct Cli {
    /// Config file path (JSON, or TOML with a .toml extension) [default: ~/.rtun/config.json]
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("rtun: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("rtun=debug,rtun_cli=debug,rtun_client=debug,rtun_core=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let (path, explicit) = match cli.config {
        Some(path) => (path, true),
        None => (config::default_path(), false),
    };
    let config = FileConfig::load(&path, explicit)?.merge(&cli.overrides);
    config.validate()?;

    let session = Arc::new(ControlSession::new(config).context("failed to set up TLS")?);

    let closer = session.clone();
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        info!(signal, "received shutdown signal");
        closer.close();
    });

    session.service().await.map_err(|e| {
        let code = e.code();
        anyhow::Error::new(e).context(format!("tunnel session ended (code {code})"))
    })?;

    info!("rtun stopped");
    Ok(())
}

/// Wait for SIGINT (Ctrl+C), SIGTERM, SIGHUP or SIGQUIT. Returns the name of
/// the signal received.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
            signal(SignalKind::quit()),
        ) {
            (Ok(mut term), Ok(mut hup), Ok(mut quit)) => {
                return tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = term.recv() => "SIGTERM",
                    _ = hup.recv() => "SIGHUP",
                    _ = quit.recv() => "SIGQUIT",
                };
            }
            _ => warn!("failed to install unix signal handlers, only Ctrl+C is handled"),
        }
    }

    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
