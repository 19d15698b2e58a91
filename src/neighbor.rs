//! The neighbor cache (spec §6): reports reachability of a peer's next hop.
//!
//! This is an external collaborator — the surrounding routing core owns the
//! real interface/ARP/ND tracking. The engine only needs `neigh_find` (with
//! the `sticky` option that returns an entry even while unreachable) and a
//! way to be woken when reachability changes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

#[async_trait]
pub trait NeighborCache: Send + Sync {
    /// Looks up reachability for `addr`. With `sticky == true`, returns the
    /// last-known entry even if currently unreachable, rather than `None`.
    async fn neigh_find(&self, addr: IpAddr, sticky: bool) -> Option<Reachability>;

    /// Subscribes to reachability changes for `addr`. `None` if no entry has
    /// ever existed for that address.
    fn watch(&self, addr: IpAddr) -> Option<watch::Receiver<Reachability>>;
}

/// In-memory neighbor cache for tests and for daemons that resolve next-hop
/// reachability out of band and simply push the result in here.
#[derive(Default)]
pub struct StaticNeighborCache {
    entries: Mutex<HashMap<IpAddr, watch::Sender<Reachability>>>,
}

impl StaticNeighborCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates the reachability of `addr`, waking any watchers.
    pub fn set(&self, addr: IpAddr, reachability: Reachability) {
        let mut entries = self.entries.lock().expect("neighbor cache lock poisoned");
        match entries.get(&addr) {
            Some(tx) => {
                let _ = tx.send(reachability);
            }
            None => {
                let (tx, _rx) = watch::channel(reachability);
                entries.insert(addr, tx);
            }
        }
    }
}

#[async_trait]
impl NeighborCache for StaticNeighborCache {
    async fn neigh_find(&self, addr: IpAddr, sticky: bool) -> Option<Reachability> {
        let entries = self.entries.lock().expect("neighbor cache lock poisoned");
        let reachability = *entries.get(&addr)?.borrow();
        if sticky || reachability == Reachability::Reachable {
            Some(reachability)
        } else {
            None
        }
    }

    fn watch(&self, addr: IpAddr) -> Option<watch::Receiver<Reachability>> {
        let entries = self.entries.lock().expect("neighbor cache lock poisoned");
        entries.get(&addr).map(|tx| tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn sticky_lookup_returns_unreachable_entries() {
        let cache = StaticNeighborCache::new();
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        cache.set(addr, Reachability::Unreachable);

        assert_eq!(cache.neigh_find(addr, false).await, None);
        assert_eq!(
            cache.neigh_find(addr, true).await,
            Some(Reachability::Unreachable)
        );
    }

    #[tokio::test]
    async fn watchers_observe_transitions() {
        let cache = StaticNeighborCache::new();
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        cache.set(addr, Reachability::Unreachable);
        let mut rx = cache.watch(addr).expect("entry exists");

        cache.set(addr, Reachability::Reachable);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Reachability::Reachable);
    }
}
