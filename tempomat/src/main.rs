#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tempomat_lib::api;
use tempomat_lib::bucket::BucketSet;
use tempomat_lib::config::{load_from_path, spawn_reload_task};
use tempomat_lib::proxy;
use tempomat_lib::telemetry::Graphite;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "CPU-fairness reverse proxy")]
struct Cli {
    /// Path to configuration JSON file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/tempomat.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_from_path(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            init_tracing(false);
            error!(%err, "refusing to start on unusable config file");
            std::process::exit(1);
        }
    };
    init_tracing(config.debug);
    if config.debug {
        info!(?config, "effective configuration");
    }
    let config = Arc::new(config);

    let buckets = Arc::new(BucketSet::new(&config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    buckets.spawn_maintenance(shutdown_rx.clone());

    if let Err(err) =
        spawn_reload_task(cli.config.clone(), buckets.clone(), shutdown_rx.clone())
    {
        error!(%err, "failed to install SIGHUP handler");
        std::process::exit(1);
    }

    if let Some(graphite) = Graphite::from_config(&config) {
        graphite.spawn(buckets.clone(), shutdown_rx.clone());
    }

    let api_listener = match TcpListener::bind(api::DEFAULT_ADDR).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr = api::DEFAULT_ADDR, "unable to set up RPC listener");
            std::process::exit(1);
        }
    };
    tokio::spawn(api::serve(api_listener, buckets.clone(), shutdown_rx.clone()));

    tokio::spawn(watch_signals(shutdown_tx));

    if let Err(err) = proxy::run(config, buckets, shutdown_rx).await {
        error!(%err, "proxy exited with error");
        std::process::exit(1);
    }
}

async fn watch_signals(shutdown: watch::Sender<bool>) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
    let _ = shutdown.send(true);
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
