//! In-process interface driver
//!
//! Keeps the peer table in memory. Selected with `driver = "memory"` for
//! running the daemon without a tunnel interface, and used by tests as a
//! stand-in for the real interface.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};

use super::{DriverPeer, InterfaceDriver};
use crate::crypto::Key;
use crate::error::DriverError;

#[derive(Debug, Default)]
pub struct MemoryDriver {
    /// Peers in insertion order, keyed by public key
    peers: Mutex<Vec<DriverPeer>>,
    set_calls: Mutex<HashMap<Key, usize>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic for a peer as if the tunnel had carried it
    pub fn record_traffic(&self, public_key: &Key, handshake_at: u64, rx: u64, tx: u64) {
        let mut peers = self.lock_peers();
        if let Some(peer) = peers.iter_mut().find(|p| &p.public_key == public_key) {
            peer.last_handshake = Some(handshake_at);
            peer.rx_bytes += rx;
            peer.tx_bytes += tx;
        }
    }

    /// Add a peer with arbitrary allowed IPs (e.g. one configured by hand)
    pub fn insert_raw(&self, peer: DriverPeer) {
        let mut peers = self.lock_peers();
        peers.retain(|p| p.public_key != peer.public_key);
        peers.push(peer);
    }

    pub fn contains(&self, public_key: &Key) -> bool {
        self.lock_peers().iter().any(|p| &p.public_key == public_key)
    }

    pub fn len(&self) -> usize {
        self.lock_peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times `set_peer` was called for a key
    pub fn set_count(&self, public_key: &Key) -> usize {
        self.set_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(public_key)
            .copied()
            .unwrap_or(0)
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, Vec<DriverPeer>> {
        // A panic while holding the lock cannot leave the Vec half-updated
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl InterfaceDriver for MemoryDriver {
    async fn set_peer(&self, public_key: &Key, allowed: Ipv4Addr) -> Result<(), DriverError> {
        let allowed_ips = vec![IpNet::V4(Ipv4Net::from(allowed))];
        {
            let mut peers = self.lock_peers();
            match peers.iter_mut().find(|p| &p.public_key == public_key) {
                Some(peer) => peer.allowed_ips = allowed_ips,
                None => peers.push(DriverPeer {
                    public_key: *public_key,
                    allowed_ips,
                    endpoint: None,
                    last_handshake: None,
                    rx_bytes: 0,
                    tx_bytes: 0,
                }),
            }
        }

        *self
            .set_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(*public_key)
            .or_insert(0) += 1;
        Ok(())
    }

    async fn remove_peer(&self, public_key: &Key) -> Result<(), DriverError> {
        self.lock_peers().retain(|p| &p.public_key != public_key);
        Ok(())
    }

    async fn dump_peers(&self) -> Result<Vec<DriverPeer>, DriverError> {
        Ok(self.lock_peers().clone())
    }
}
