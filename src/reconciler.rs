//! Interface reconciler
//!
//! Applies registry changes to the live interface and reads the interface
//! back for status reporting. The registry decides which peers exist; the
//! interface only contributes traffic statistics. Nothing here retries:
//! driver failures are returned to the caller, which owns compensation.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use serde::Serialize;

use crate::crypto::Key;
use crate::driver::InterfaceDriver;
use crate::error::DriverError;
use crate::registry::PeerRecord;

/// Live statistics for one peer, as reported by the interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveStats {
    #[serde(skip)]
    pub public_key: Key,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    /// Unix epoch seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_handshake: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Registry peers that were missing or misrouted and got pushed
    pub pushed: usize,
    /// Registry peers already present with the right route
    pub in_sync: usize,
    /// Interface peers unknown to the registry that were removed
    pub pruned: usize,
    /// Interface peers unknown to the registry that were left alone
    pub unmanaged: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    driver: Arc<dyn InterfaceDriver>,
}

impl Reconciler {
    pub fn new(driver: Arc<dyn InterfaceDriver>) -> Self {
        Self { driver }
    }

    /// Put one peer on the interface, routed to its single address
    pub async fn push(&self, record: &PeerRecord) -> Result<(), DriverError> {
        self.driver
            .set_peer(&record.public_key, record.address)
            .await?;
        tracing::debug!("Pushed peer {} ({}) to interface", record.id, record.address);
        Ok(())
    }

    /// Take one peer off the interface; absent peers are fine
    pub async fn remove(&self, public_key: &Key) -> Result<(), DriverError> {
        self.driver.remove_peer(public_key).await?;
        tracing::debug!("Removed peer {:?} from interface", public_key);
        Ok(())
    }

    /// Read-only view of the interface keyed by allocated address
    ///
    /// Peers whose allowed IPs are not a single IPv4 host cannot belong to
    /// a registry record and are left out.
    pub async fn snapshot(&self) -> Result<HashMap<Ipv4Addr, LiveStats>, DriverError> {
        let peers = self.driver.dump_peers().await?;

        Ok(peers
            .into_iter()
            .filter_map(|peer| {
                let address = peer.single_host()?;
                Some((
                    address,
                    LiveStats {
                        public_key: peer.public_key,
                        endpoint: peer.endpoint,
                        last_handshake: peer.last_handshake,
                        rx_bytes: peer.rx_bytes,
                        tx_bytes: peer.tx_bytes,
                    },
                ))
            })
            .collect())
    }

    /// Bring the interface in line with the registry
    ///
    /// Pushes every record that is missing or routed differently. With
    /// `prune`, interface peers that no record knows about are removed.
    /// Running it again right after is a no-op.
    pub async fn reconcile(
        &self,
        records: &[PeerRecord],
        prune: bool,
    ) -> Result<ReconcileReport, DriverError> {
        let live: HashMap<Key, Vec<IpNet>> = self
            .driver
            .dump_peers()
            .await?
            .into_iter()
            .map(|p| (p.public_key, p.allowed_ips))
            .collect();

        let mut report = ReconcileReport::default();

        for record in records {
            let wanted = vec![IpNet::V4(Ipv4Net::from(record.address))];
            if live.get(&record.public_key) == Some(&wanted) {
                report.in_sync += 1;
                continue;
            }
            tracing::info!(
                "Restoring peer {} ({}) on interface",
                record.id,
                record.address
            );
            self.push(record).await?;
            report.pushed += 1;
        }

        let known: HashSet<&Key> = records.iter().map(|r| &r.public_key).collect();
        for key in live.keys().filter(|k| !known.contains(k)) {
            if prune {
                tracing::info!("Pruning unknown peer {:?} from interface", key);
                self.remove(key).await?;
                report.pruned += 1;
            } else {
                report.unmanaged += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyProvider, SequentialKeyProvider};
    use crate::driver::{DriverPeer, MemoryDriver};

    fn records(n: u8) -> Vec<PeerRecord> {
        let keys = SequentialKeyProvider::default();
        (0..n)
            .map(|i| {
                let pair = keys.generate().unwrap();
                PeerRecord {
                    id: format!("peer{}", i),
                    name: format!("Peer {}", i),
                    address: Ipv4Addr::new(10, 8, 0, 2 + i),
                    public_key: pair.public_key,
                    private_key: pair.private_key,
                    created_at: 0,
                }
            })
            .collect()
    }

    fn setup() -> (Arc<MemoryDriver>, Reconciler) {
        let driver = Arc::new(MemoryDriver::new());
        let reconciler = Reconciler::new(driver.clone());
        (driver, reconciler)
    }

    #[tokio::test]
    async fn test_push_and_snapshot() {
        let (driver, reconciler) = setup();
        let records = records(2);
        for record in &records {
            reconciler.push(record).await.unwrap();
        }
        driver.record_traffic(&records[1].public_key, 1_706_600_000, 10, 20);

        let snapshot = reconciler.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        let stats = &snapshot[&Ipv4Addr::new(10, 8, 0, 3)];
        assert_eq!(stats.public_key, records[1].public_key);
        assert_eq!(stats.last_handshake, Some(1_706_600_000));
        assert_eq!((stats.rx_bytes, stats.tx_bytes), (10, 20));
    }

    #[tokio::test]
    async fn test_snapshot_skips_multi_range_peers() {
        let (driver, reconciler) = setup();
        driver.insert_raw(DriverPeer {
            public_key: Key::from_bytes([9; 32]),
            allowed_ips: vec!["192.168.0.0/24".parse().unwrap()],
            endpoint: None,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        });
        assert!(reconciler.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_twice_is_ok() {
        let (driver, reconciler) = setup();
        let records = records(1);
        reconciler.push(&records[0]).await.unwrap();
        reconciler.remove(&records[0].public_key).await.unwrap();
        reconciler.remove(&records[0].public_key).await.unwrap();
        assert!(!driver.contains(&records[0].public_key));
    }

    #[tokio::test]
    async fn test_reconcile_restores_empty_interface() {
        let (driver, reconciler) = setup();
        let records = records(3);

        let report = reconciler.reconcile(&records, false).await.unwrap();
        assert_eq!(report.pushed, 3);
        assert_eq!(driver.len(), 3);

        // Second pass changes nothing
        let report = reconciler.reconcile(&records, false).await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                pushed: 0,
                in_sync: 3,
                pruned: 0,
                unmanaged: 0
            }
        );
        assert_eq!(driver.set_count(&records[0].public_key), 1);
    }

    #[tokio::test]
    async fn test_reconcile_fixes_wrong_route() {
        let (driver, reconciler) = setup();
        let records = records(1);
        driver
            .set_peer(&records[0].public_key, Ipv4Addr::new(10, 8, 0, 200))
            .await
            .unwrap();

        let report = reconciler.reconcile(&records, false).await.unwrap();
        assert_eq!(report.pushed, 1);
        let snapshot = reconciler.snapshot().await.unwrap();
        assert!(snapshot.contains_key(&records[0].address));
    }

    #[tokio::test]
    async fn test_reconcile_prunes_only_when_asked() {
        let (driver, reconciler) = setup();
        let records = records(1);
        let stranger = Key::from_bytes([42; 32]);
        driver
            .set_peer(&stranger, Ipv4Addr::new(10, 8, 0, 99))
            .await
            .unwrap();

        let report = reconciler.reconcile(&records, false).await.unwrap();
        assert_eq!(report.unmanaged, 1);
        assert!(driver.contains(&stranger));

        let report = reconciler.reconcile(&records, true).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(!driver.contains(&stranger));
        assert!(driver.contains(&records[0].public_key));
    }
}
