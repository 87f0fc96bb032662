//! Boundary to the external tunnel interface
//!
//! The live peer table of the interface belongs to the tunnel implementation,
//! not to this process. Everything that touches it goes through
//! [`InterfaceDriver`], which has two implementations:
//!
//! - [`awg::AwgDriver`] drives a real interface through the `awg`/`wg` tool
//! - [`memory::MemoryDriver`] keeps the table in process (development, tests)

pub mod awg;
pub mod memory;

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use ipnet::IpNet;

use crate::crypto::Key;
use crate::error::DriverError;

pub use awg::AwgDriver;
pub use memory::MemoryDriver;

/// One peer as reported by the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPeer {
    pub public_key: Key,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<SocketAddr>,
    /// Unix epoch seconds of the latest handshake, if any
    pub last_handshake: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl DriverPeer {
    /// The single host this peer is routed to, if its allowed IPs are exactly one /32
    pub fn single_host(&self) -> Option<Ipv4Addr> {
        match self.allowed_ips.as_slice() {
            [IpNet::V4(net)] if net.prefix_len() == 32 => Some(net.addr()),
            _ => None,
        }
    }
}

/// Declarative access to the interface peer table
///
/// All operations are idempotent: setting an existing peer replaces its
/// allowed IPs, removing an absent peer succeeds.
#[async_trait]
pub trait InterfaceDriver: Send + Sync {
    /// Add or update a peer, routing exactly `allowed` to it
    async fn set_peer(&self, public_key: &Key, allowed: Ipv4Addr) -> Result<(), DriverError>;

    /// Remove a peer by public key
    async fn remove_peer(&self, public_key: &Key) -> Result<(), DriverError>;

    /// Read every peer currently configured on the interface
    async fn dump_peers(&self) -> Result<Vec<DriverPeer>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(allowed: &[&str]) -> DriverPeer {
        DriverPeer {
            public_key: Key::from_bytes([7; 32]),
            allowed_ips: allowed.iter().map(|s| s.parse().unwrap()).collect(),
            endpoint: None,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    #[test]
    fn test_single_host() {
        assert_eq!(
            peer(&["10.8.0.2/32"]).single_host(),
            Some(Ipv4Addr::new(10, 8, 0, 2))
        );
        assert_eq!(peer(&["10.8.0.0/24"]).single_host(), None);
        assert_eq!(peer(&["10.8.0.2/32", "10.8.0.3/32"]).single_host(), None);
        assert_eq!(peer(&[]).single_host(), None);
        assert_eq!(peer(&["fd00::2/128"]).single_host(), None);
    }
}
