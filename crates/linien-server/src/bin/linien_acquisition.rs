//! Linien Acquisition - the worker process that owns the acquisition hardware.
//!
//! Spawned by the control server, it speaks the worker channel protocol on
//! stdin/stdout. With `--listen` it instead accepts one supervisor over TCP,
//! for debugging a worker started by hand.

use anyhow::Result;
use clap::Parser;
use linien_core::acquisition::{run_worker, SimulatedAcquisition, WorkerOptions};
use linien_core::AcquisitionConfig;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "linien-acquisition")]
#[command(about = "Acquisition worker for the Linien server")]
struct Args {
    /// Serve the channel over TCP instead of stdio
    #[arg(long)]
    listen: bool,

    /// Port to listen on with --listen
    #[arg(short, long, default_value_t = AcquisitionConfig::DEBUG_PORT)]
    port: u16,

    /// Host to bind to with --listen
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Worker loop interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Stdout carries the channel, so logs go to stderr.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut options = WorkerOptions::new();
    if let Some(ms) = args.poll_interval_ms {
        options = options.with_poll_interval(Duration::from_millis(ms));
    }

    let exit = if args.listen {
        let listener = TcpListener::bind(SocketAddr::new(args.host, args.port)).await?;
        info!("Waiting for supervisor on {}", listener.local_addr()?);
        let (stream, peer) = listener.accept().await?;
        info!("Supervisor connected from {}", peer);
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        run_worker(SimulatedAcquisition::new(), reader, writer, options).await?
    } else {
        run_worker(
            SimulatedAcquisition::new(),
            tokio::io::stdin(),
            tokio::io::stdout(),
            options,
        )
        .await?
    };

    info!("Acquisition worker exited: {:?}", exit);
    Ok(())
}
