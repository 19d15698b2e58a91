//! The object-lock manager (spec §4.2, glossary: "Object lock").
//!
//! An external mutual-exclusion primitive keyed by `(address, protocol,
//! port)` that prevents two peer instances from racing on the same remote
//! address. A peer stays in `Prepare` until its lock is granted.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub addr: IpAddr,
    pub proto: &'static str,
    pub port: u16,
}

impl LockKey {
    pub fn bgp(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            proto: "tcp",
            port,
        }
    }
}

/// Holds the lock until dropped; released automatically.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
pub trait ObjectLock: Send + Sync {
    async fn acquire(&self, key: LockKey) -> LockGuard;
}

/// Process-wide registry of per-key mutexes. One engine normally holds a
/// single [`LockRegistry`] shared by every [`crate::peer::PeerInstance`] it
/// manages, so that two peer instances configured against the same remote
/// address serialize on the same lock rather than racing.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectLock for LockRegistry {
    async fn acquire(&self, key: LockKey) -> LockGuard {
        let mutex = {
            let mut locks = self.locks.lock().await;
            locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let guard = mutex.lock_owned().await;
        LockGuard { _guard: guard }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[tokio::test]
    async fn second_acquire_on_same_key_waits_for_the_first_to_drop() {
        let registry = Arc::new(LockRegistry::new());
        let key = LockKey::bgp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 179);

        let guard = registry.acquire(key).await;

        let registry2 = registry.clone();
        let second = tokio::spawn(async move { registry2.acquire(key).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(guard);
        let _second_guard = tokio::time::timeout(Duration::from_millis(50), second)
            .await
            .expect("second acquire completes once the first guard is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let registry = LockRegistry::new();
        let a = LockKey::bgp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 179);
        let b = LockKey::bgp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 179);
        let _g1 = registry.acquire(a).await;
        let _g2 = tokio::time::timeout(Duration::from_millis(20), registry.acquire(b))
            .await
            .expect("distinct keys don't block each other");
    }
}
