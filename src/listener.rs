//! The shared listening endpoint (spec §4.1, §5, §9 design notes).
//!
//! Exactly one passive TCP socket is bound per local address/port,
//! reference-counted across the peers that need it; the last release tears
//! it down. Modeled as an `Arc` + explicit refcount rather than relying on
//! socket lifetime, so "no global write outside acquire/release" holds
//! without any unsafe code.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::{debug, warn};
use net2::TcpBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Installs/removes TCP MD5 signature keys on the shared socket (spec §6
/// downward interface). Actual MD5 setup is OS-specific raw-socket work
/// that belongs to the surrounding daemon, not this crate, so this is a
/// thin external collaborator like `NeighborCache` or `RibImporter`.
pub trait Md5KeyStore: Send + Sync {
    fn install_key(&self, addr: IpAddr, password: &str) -> io::Result<()>;
    fn remove_key(&self, addr: IpAddr) -> io::Result<()>;
}

/// No keys installed; used when no peer configures a password and in tests.
#[derive(Default)]
pub struct NoopMd5KeyStore;

impl Md5KeyStore for NoopMd5KeyStore {
    fn install_key(&self, _addr: IpAddr, _password: &str) -> io::Result<()> {
        Ok(())
    }

    fn remove_key(&self, _addr: IpAddr) -> io::Result<()> {
        Ok(())
    }
}

struct SharedState {
    listener: Option<Arc<TcpListener>>,
    refcount: usize,
    routes: HashMap<IpAddr, mpsc::UnboundedSender<TcpStream>>,
    accept_task: Option<JoinHandle<()>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            listener: None,
            refcount: 0,
            routes: HashMap::new(),
            accept_task: None,
        }
    }
}

/// Process-wide singleton; one instance is shared by every peer an engine
/// manages. Cloning is cheap (it's an `Arc` around the shared state).
#[derive(Clone, Default)]
pub struct ListeningEndpoint {
    state: Arc<Mutex<SharedState>>,
}

impl ListeningEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest from a peer at `remote_ip`: binds the shared
    /// socket (lazily, on the first caller) and returns a channel that
    /// yields inbound connections whose source address matches `remote_ip`.
    /// Unexpected connections (no matching peer) are logged and dropped.
    pub async fn acquire(
        &self,
        bind_addr: SocketAddr,
        remote_ip: IpAddr,
    ) -> io::Result<mpsc::UnboundedReceiver<TcpStream>> {
        let mut state = self.state.lock().await;
        if state.listener.is_none() {
            let listener = bind_listener(bind_addr)?;
            let listener = Arc::new(listener);
            state.listener = Some(listener.clone());
            let accept_state = self.state.clone();
            state.accept_task = Some(tokio::spawn(accept_loop(listener, accept_state)));
            debug!("listening endpoint bound at {}", bind_addr);
        }
        state.refcount += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.routes.insert(remote_ip, tx);
        Ok(rx)
    }

    /// Releases a peer's interest. When the last holder releases, the
    /// socket and its accept task are torn down.
    pub async fn release(&self, remote_ip: IpAddr) {
        let mut state = self.state.lock().await;
        state.routes.remove(&remote_ip);
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 {
            if let Some(task) = state.accept_task.take() {
                task.abort();
            }
            state.listener = None;
            debug!("listening endpoint torn down (no active peers)");
        }
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.refcount
    }
}

fn bind_listener(bind_addr: SocketAddr) -> io::Result<TcpListener> {
    let builder = match bind_addr {
        SocketAddr::V4(_) => TcpBuilder::new_v4()?,
        SocketAddr::V6(_) => TcpBuilder::new_v6()?,
    };
    builder.reuse_address(true)?;
    builder.bind(bind_addr)?;
    let std_listener = builder.listen(1024)?;
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

async fn accept_loop(listener: Arc<TcpListener>, state: Arc<Mutex<SharedState>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let sender = {
                    let state = state.lock().await;
                    state.routes.get(&peer_addr.ip()).cloned()
                };
                match sender {
                    Some(tx) => {
                        if tx.send(stream).is_err() {
                            warn!("peer for {} gone before accept delivered", peer_addr.ip());
                        }
                    }
                    None => {
                        warn!(
                            "unexpected connection from {}: not a configured peer",
                            peer_addr.ip()
                        );
                    }
                }
            }
            Err(err) => {
                warn!("accept() failed on shared listener: {}", err);
                break;
            }
        }
    }
}
