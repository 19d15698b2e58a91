//! The RIB importer (spec §1, §4.7, §6): an external collaborator.
//!
//! Route selection policy, attribute semantics, and the wire format are
//! explicitly out of scope for this crate — the routing information base
//! belongs to the surrounding routing core. The engine's only RIB-facing
//! responsibility is the route-limit guard in §4.7, so that is the only
//! surface exposed here; `import_control`/`rte_better`/`reload_routes` are
//! named because §6 lists them as callbacks the daemon exposes upward, but
//! their bodies are the routing core's, not this engine's, to write.

use std::sync::atomic::{AtomicUsize, Ordering};

/// What the routing core exposes to a peer's session engine.
pub trait RibImporter: Send + Sync {
    /// Routes currently imported from this peer. Compared against
    /// `PeerConfig::route_limit` by the route-limit guard (§4.7).
    fn imported_route_count(&self) -> usize;
}

/// A RIB importer backed by a single counter, standing in for the real RIB
/// in tests and in configurations that don't care about per-peer counting.
#[derive(Default)]
pub struct CountingRib {
    count: AtomicUsize,
}

impl CountingRib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an imported route, as the real RIB would on each accepted
    /// NLRI from this peer.
    pub fn record_import(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_withdraw(&self) {
        self.count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
            Some(c.saturating_sub(1))
        })
        .ok();
    }
}

impl RibImporter for CountingRib {
    fn imported_route_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}
