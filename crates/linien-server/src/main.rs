//! Linien Server - control server for the Linien laser lock.
//!
//! Serves the parameter store over length-prefixed JSON-RPC and supervises the
//! acquisition worker, publishing its frames as the `acquisition` parameter.

mod server;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use linien_core::acquisition::{
    AcquisitionOptions, EnvironmentHooks, NoopHooks, SimulatedAcquisition, SystemdServices,
    WorkerLaunch,
};
use linien_core::ServerConfig;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::server::ControlServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WorkerMode {
    /// Launch the linien-acquisition binary as a child process
    Spawn,
    /// Run a simulated worker inside the server process
    InProcess,
    /// Connect to a manually started worker (debug mode)
    Remote,
}

#[derive(Parser, Debug)]
#[command(name = "linien-server")]
#[command(about = "Control server for the Linien laser lock")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = ServerConfig::DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = ServerConfig::DEFAULT_HOST)]
    host: IpAddr,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// How the acquisition worker is started
    #[arg(long, value_enum, default_value_t = WorkerMode::Spawn)]
    worker: WorkerMode,

    /// Host of the remote worker in debug mode
    #[arg(long, default_value = "127.0.0.1")]
    worker_host: IpAddr,

    /// Stop the board's web services while the worker runs
    #[arg(long)]
    suspend_services: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Linien Server");

    let launch = match args.worker {
        WorkerMode::Spawn => WorkerLaunch::sibling_binary()?,
        WorkerMode::InProcess => WorkerLaunch::InProcess(Box::new(SimulatedAcquisition::new())),
        WorkerMode::Remote => WorkerLaunch::remote(args.worker_host),
    };
    let hooks: Arc<dyn EnvironmentHooks> = if args.suspend_services {
        Arc::new(SystemdServices::board_services())
    } else {
        Arc::new(NoopHooks)
    };

    let addr = SocketAddr::new(args.host, args.port);
    let server = ControlServer::start(addr, AcquisitionOptions::new(launch).with_hooks(hooks))
        .await
        .context("failed to start control server")?;

    // The exit hook stops the worker and restores the environment even if the
    // async shutdown below never gets to run.
    let (exit_tx, mut exit_rx) = watch::channel(false);
    let exit_hook = server.acquisition.exit_hook();
    ctrlc::set_handler(move || {
        exit_hook.run();
        let _ = exit_tx.send(true);
    })
    .context("failed to install signal handler")?;

    info!("Linien server running on {}", server.addr());

    // Wait for shutdown signal
    exit_rx.changed().await?;
    info!("Shutdown signal received, exiting");

    server.stop().await?;
    Ok(())
}
