use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use mstream::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "mstream-server", version, about = "Measurement server: serves download/upload goodput subtests over WebSockets")]
struct Args {
    /// Listen address for cleartext connections.
    #[arg(long, default_value = "0.0.0.0:8080", env = "MSTREAM_LISTEN")]
    listen: SocketAddr,

    /// Listen address for TLS connections.
    #[arg(long, env = "MSTREAM_TLS_LISTEN")]
    tls_listen: Option<SocketAddr>,

    /// PEM certificate chain for the TLS listener.
    #[arg(long, requires = "tls_listen")]
    cert_file: Option<PathBuf>,

    /// PEM private key for the TLS listener.
    #[arg(long, requires = "tls_listen")]
    key_file: Option<PathBuf>,

    /// Directory receiving one JSON record per measured stream.
    #[arg(long, default_value = "results", env = "MSTREAM_DATA_DIR")]
    data_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    set_logger();
    let args = Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let server = Server::new(ServerConfig {
        listen: args.listen,
        tls_listen: args.tls_listen,
        cert_file: args.cert_file,
        key_file: args.key_file,
        data_dir: args.data_dir,
    });
    let bound = server.bind().await.context("binding listeners")?;
    tracing::info!(addr = %bound.local_addr()?, version = mstream::VERSION, "serving measurement requests");
    if let Some(addr) = bound.tls_local_addr() {
        tracing::info!(%addr, "serving TLS measurement requests");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    bound.run(shutdown_rx).await;
    Ok(())
}

fn set_logger() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
