use std::io::Result;
use std::net::IpAddr;
use std::sync::Arc;

use clap::Parser;
use env_logger::Builder;
use log::{debug, info, LevelFilter};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use bgp_engine::config;
use bgp_engine::engine::Engine;
use bgp_engine::neighbor::{Reachability, StaticNeighborCache};
use bgp_engine::rib::CountingRib;

/// BGP-4 per-peer session engine.
#[derive(Parser)]
#[clap(name = "bgp-engine", version, author = "Mat Wood <mat@thepacketgeek.com>")]
struct Cli {
    /// Path to the TOML server config.
    #[clap(index = 1)]
    config_path: String,

    /// IP address to listen on.
    #[clap(short = 'a', long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// TCP port to listen on.
    #[clap(short = 'p', long, default_value_t = 179)]
    port: u16,

    /// Logging verbosity; repeat for more (-v, -vv, -vvv).
    #[clap(short = 'v', long, parse(from_occurrences))]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (crate_level, other_level) = match cli.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("bgp_engine"), crate_level)
        .filter(None, other_level)
        .init();
    info!("logging at levels {}/{}", crate_level, other_level);

    let server_config = config::from_file(&cli.config_path)?;
    debug!(
        "found {} peers in {}",
        server_config.peers.len(),
        cli.config_path
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(server_config, cli.address, cli.port))
}

async fn run(server_config: config::ServerConfig, address: IpAddr, port: u16) -> Result<()> {
    let static_neighbors = StaticNeighborCache::new();
    // This binary has no interface/ARP/ND feed of its own to drive next-hop
    // reachability; every configured peer's next hop is marked reachable up
    // front so the engine can proceed straight to Connect/Active. A daemon
    // embedding this engine alongside a real routing core would instead push
    // updates into the cache as interfaces/neighbors come and go.
    for peer_config in &server_config.peers {
        let next_hop = peer_config.multihop_via.unwrap_or(peer_config.remote_ip);
        static_neighbors.set(next_hop, Reachability::Reachable);
    }
    let neighbors: Arc<dyn bgp_engine::neighbor::NeighborCache> = Arc::new(static_neighbors);
    let rib: Arc<dyn bgp_engine::rib::RibImporter> = Arc::new(CountingRib::new());
    let mut engine = Engine::new(std::net::SocketAddr::new(address, port), neighbors, rib);
    engine.spawn(&server_config);

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signal_task = tokio::task::spawn_blocking(move || signals.forever().next());
    signal_task.await.ok();
    info!("shutdown signal received, draining peers");

    engine.shutdown().await;
    Ok(())
}
