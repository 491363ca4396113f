//! kitsune-dns - a censorship-aware DNS proxy.
//!
//! Client queries come in over UDP and TCP and are dispatched through a
//! user-configured graph of resolvers (caching, chained fallback,
//! parallel racing, hosts/dynamic tables and a CN-vs-abroad selector).
//! All upstream traffic shares one UDP socket, demultiplexed by
//! transaction ID.

mod cn_ip;
mod config;
mod dns;
mod error;
mod hosts;
mod resolver;
mod server;
mod stats;
mod web;

use std::sync::Arc;

use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info};

use crate::config::Config;
use crate::resolver::upstream::UdpExchanger;
use crate::server::Frontend;
use crate::stats::Stats;

#[derive(Parser)]
#[command(name = "kitsune-dns")]
#[command(about = "DNS proxy with a pluggable resolver graph", version)]
struct Args {
    /// Config file
    #[arg(short = 'c', long = "config", default_value = "cfg.json")]
    config: String,

    /// Expose an HTTP debug endpoint on this host:port
    #[arg(long = "debug", value_name = "host:port")]
    debug: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kitsune_dns=info".into()),
        )
        .init();

    let args = Args::parse();
    info!("🦊 kitsune-dns v{} starting...", env!("CARGO_PKG_VERSION"));

    let cfg = Config::load(&args.config)?;
    info!("config loaded from {} ({} resolvers)", args.config, cfg.resolvers.len());

    // One shared socket for all upstream traffic.
    let exchanger = UdpExchanger::start().await?;
    let root = config::build_graph(&cfg, exchanger.clone())?;
    info!("resolver graph ready (root: {})", root.name());

    let stats = Arc::new(Stats::new());
    if let Some(addr) = args.debug {
        let stats = stats.clone();
        tokio::spawn(async move {
            if let Err(e) = web::server::run_debug(addr, stats).await {
                error!("debug endpoint: {}", e);
            }
        });
    }

    let udp_socket = UdpSocket::bind(&cfg.listen).await?;
    let tcp_listener = TcpListener::bind(&cfg.listen).await?;

    let frontend = Arc::new(Frontend::new(root, cfg.timeout(), stats));
    let udp = frontend.clone();
    tokio::spawn(async move {
        if let Err(e) = udp.run_udp(udp_socket).await {
            error!("udp server: {}", e);
        }
    });
    let tcp = frontend.clone();
    tokio::spawn(async move {
        if let Err(e) = tcp.run_tcp(tcp_listener).await {
            error!("tcp server: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down ({} pending upstream calls)", exchanger.pending_calls());
    exchanger.stop();
    Ok(())
}
