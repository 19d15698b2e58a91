//! The top-level orchestrator (spec §2, §5): binds the shared collaborators
//! together and spawns one task per configured peer. Analogous to the
//! teacher's `SessionManager`, but peers drive themselves rather than being
//! polled from a central loop, matching the per-peer-task concurrency model
//! in section 5.

use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::listener::{ListeningEndpoint, Md5KeyStore, NoopMd5KeyStore};
use crate::neighbor::NeighborCache;
use crate::objectlock::{LockRegistry, ObjectLock};
use crate::peer::PeerInstance;
use crate::rib::RibImporter;

pub struct Engine {
    listener: ListeningEndpoint,
    locks: Arc<dyn ObjectLock>,
    neighbors: Arc<dyn NeighborCache>,
    rib: Arc<dyn RibImporter>,
    md5: Arc<dyn Md5KeyStore>,
    bind_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    peers: Vec<JoinHandle<PeerInstance>>,
}

impl Engine {
    pub fn new(
        bind_addr: SocketAddr,
        neighbors: Arc<dyn NeighborCache>,
        rib: Arc<dyn RibImporter>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            listener: ListeningEndpoint::new(),
            locks: Arc::new(LockRegistry::new()),
            neighbors,
            rib,
            md5: Arc::new(NoopMd5KeyStore),
            bind_addr,
            shutdown_tx,
            shutdown_rx,
            peers: Vec::new(),
        }
    }

    /// Spawns one task per enabled peer in `config`.
    pub fn spawn(&mut self, config: &ServerConfig) {
        for peer_config in &config.peers {
            let peer = PeerInstance::new(peer_config.clone());
            info!("starting peer {}", peer_config.remote_ip);
            let handle = tokio::spawn(peer.run(
                self.locks.clone(),
                self.neighbors.clone(),
                self.rib.clone(),
                self.listener.clone(),
                self.bind_addr,
                self.md5.clone(),
                config.poll_interval,
                self.shutdown_rx.clone(),
            ));
            self.peers.push(handle);
        }
    }

    /// Signals every peer to shut down (spec §4.2 "on shutdown requested")
    /// and waits for each task to drain its Notification and reach Idle.
    pub async fn shutdown(self) -> Vec<PeerInstance> {
        let _ = self.shutdown_tx.send(true);
        let mut finished = Vec::with_capacity(self.peers.len());
        for handle in self.peers {
            if let Ok(peer) = handle.await {
                finished.push(peer);
            }
        }
        finished
    }

    pub async fn listening_refcount(&self) -> usize {
        self.listener.active_count().await
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}
