use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tether::daemon::Daemon;
use tether::ipc::{IpcServer, DEFAULT_SOCKET_PATH};
use tether::process::{Supervisor, SupervisorSettings};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Tether daemon - supervises the apps of an ecosystem descriptor
#[derive(Parser)]
#[command(name = "tether-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Ecosystem descriptor (.toml or .json)
    #[arg(short, long)]
    config: PathBuf,

    /// Control socket path
    #[arg(long, env = "TETHER_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Resource sampling interval in milliseconds
    #[arg(long, default_value_t = 2000)]
    sample_interval_ms: u64,

    /// How long a child must stay up before it counts as running, in milliseconds
    #[arg(long, default_value_t = 1000)]
    start_grace_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = SupervisorSettings {
        start_grace: Duration::from_millis(args.start_grace_ms),
        sample_interval: Duration::from_millis(args.sample_interval_ms),
        ..SupervisorSettings::default()
    };
    let supervisor = Supervisor::new(settings);

    let daemon = Daemon::new(supervisor.clone(), &args.config)
        .with_context(|| format!("Failed to load descriptor {}", args.config.display()))?;
    daemon.start_all().await;

    let mut server = IpcServer::with_socket_path(&args.socket);
    server
        .start()
        .with_context(|| format!("Failed to listen on {}", args.socket.display()))?;
    info!("IPC server listening on: {}", args.socket.display());

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let handler_daemon = daemon.clone();
    tokio::select! {
        result = server.run(move |command| {
            let daemon = handler_daemon.clone();
            async move { daemon.handle(command).await }
        }) => {
            if let Err(e) = result {
                error!("IPC server error: {}", e);
            }
        }
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    info!("Shutting down");
    supervisor.shutdown().await;
    server.stop().context("Failed to remove control socket")?;
    info!("Daemon stopped");

    Ok(())
}
