use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gtpud::config::Config;
use gtpud::cups;
use gtpud::daemon::Daemon;

#[derive(Parser)]
#[command(name = "gtpud", about = "GTP-U user plane daemon for simulated UEs")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "gtpud.toml")]
    config: PathBuf,

    /// Detach from the terminal after initialization
    #[arg(short, long)]
    daemonize: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to open config file: {e}");
            process::exit(2);
        }
    };

    if args.daemonize {
        if let Err(e) = nix::unistd::daemon(false, false) {
            eprintln!("Error during daemonize: {e}");
            process::exit(1);
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!(error = %e, "Initialization failed");
        process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    // The runtime thread is the control thread: registry mutation and
    // subprocess launches happen here and nowhere else.
    let daemon = Daemon::new();

    let addr = config.cups.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to create UECUPS socket {addr}"))?;
    info!(%addr, "UECUPS control socket listening");

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    tokio::select! {
        res = cups::serve(Arc::clone(&daemon), listener) => {
            res.context("UECUPS server failed")?;
        }
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    daemon.reset_tunnels();
    daemon.subprocesses.kill_all();
    info!("Server stopped");
    Ok(())
}
