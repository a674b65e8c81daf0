//! ERC-20 permit relayer binary.
//!
//! # Usage
//!
//! ```bash
//! permit-relayer --config ./config.toml
//!
//! # Raise the log level
//! RUST_LOG=debug permit-relayer --config ./config.toml
//! ```
//!
//! Startup is fatal on configuration, database, or keystore failures; the
//! process exits nonzero. At runtime the signer and keeper loops absorb
//! transient upstream errors and retry on their next tick.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use permit_relayer::chain::HttpChainClient;
use permit_relayer::config::Config;
use permit_relayer::keeper::Keeper;
use permit_relayer::processor::RequestProcessor;
use permit_relayer::server;
use permit_relayer::signer::Signer;
use permit_relayer::store::PgStore;
use permit_relayer::upstream::UpstreamClient;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "permit-relayer", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    let default_filter = if config.log_debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(err) = run(config).await {
        tracing::error!("relayer failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(port = config.proxy_port, "ERC-20 permit relayer starting");
    tracing::info!(endpoint = %config.rpc_endpoint, "using upstream rpc endpoint");
    tracing::info!(
        host = %config.db.host,
        port = config.db.port,
        database = %config.db.database,
        "connecting database"
    );

    let store = Arc::new(PgStore::connect(&config.db).await?);
    let chain = Arc::new(HttpChainClient::new(config.rpc_endpoint.parse()?));
    let upstream = UpstreamClient::new(config.rpc_endpoint.parse()?);

    let signer = Arc::new(Signer::from_config(
        &config,
        Arc::clone(&store),
        Arc::clone(&chain),
    )?);
    let keeper = Arc::new(Keeper::from_config(
        &config,
        Arc::clone(&store),
        Arc::clone(&chain),
    ));

    let mut loops = Vec::new();
    if config.signer.enable {
        signer.prepare().await?;
        loops.push(tokio::spawn(Arc::clone(&signer).run()));
    } else {
        tracing::info!("transaction sender disabled");
    }
    if config.keeper.enable {
        tracing::info!(instance = %config.keeper.instance_id, "transaction keeper enabled");
        loops.push(tokio::spawn(Arc::clone(&keeper).run()));
    } else {
        tracing::info!("transaction keeper disabled");
    }

    let processor = Arc::new(RequestProcessor::new(
        &config,
        upstream,
        Arc::clone(&store),
        Arc::clone(&signer),
    ));
    let app = server::router(processor);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.proxy_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("proxy listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let both loops drain before releasing the database.
    signer.close();
    keeper.close();
    for handle in loops {
        let _ = handle.await;
    }
    store.close().await;

    tracing::info!("relayer shut down gracefully");
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM (Unix) to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received Ctrl-C, shutting down..."),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl-C");
        tracing::info!("received Ctrl-C, shutting down...");
    }
}
