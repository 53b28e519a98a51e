use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use griddht::{DhtConfig, Kademlia, Keypair, TcpTransport};

#[derive(Parser, Debug)]
#[command(name = "griddht")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address.
    #[arg(short, long, default_value = "127.0.0.1:4000")]
    bind: SocketAddr,

    /// Address peers should dial. Required when binding a wildcard IP.
    #[arg(short, long, value_name = "ADDR")]
    advertise: Option<SocketAddr>,

    /// Address of a node already in the network.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Hex secp256k1 secret key; a fresh one is generated when absent.
    #[arg(long, value_name = "HEX")]
    secret: Option<String>,

    #[arg(short, long, default_value = "300")]
    snapshot_interval: u64,

    #[arg(long, default_value = "1000")]
    request_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = match &args.secret {
        Some(hex) => Keypair::from_secret_hex(hex).context("invalid --secret")?,
        None => Keypair::generate(),
    };

    let config = DhtConfig::default()
        .with_request_timeout(Duration::from_millis(args.request_timeout_ms));
    let transport = Arc::new(TcpTransport::new(config.max_frame_size));
    if args.bind.ip().is_unspecified() && args.advertise.is_none() {
        bail!("--bind {} is a wildcard address; pass --advertise with a reachable one", args.bind);
    }
    let advertise = args.advertise.map(|a| a.to_string());
    let node = Kademlia::start_advertising(
        transport,
        &args.bind.to_string(),
        advertise.as_deref(),
        keypair.id(),
        config,
    )
    .await
    .context("failed to start node")?;
    info!(id = %node.id(), addr = %node.address(), "node started");

    for peer in &args.bootstrap {
        info!("Bootstrapping from {}", peer);
        match node.register_network(&peer.to_string()).await {
            Ok(found) => {
                info!(peers = found.len(), "Bootstrap complete");
            }
            Err(e) => {
                warn!(error = %e, "Bootstrap failed");
            }
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.snapshot_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                match node.stats().await {
                    Ok(snapshot) => info!(
                        contacts = snapshot.contacts,
                        stored_values = snapshot.stored_values,
                        "state snapshot"
                    ),
                    Err(e) => warn!(error = %e, "state snapshot failed"),
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
