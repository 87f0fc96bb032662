//! Peer provisioning service
//!
//! Orchestrates the registry, the address pool, the key provider and the
//! interface reconciler. Registry and pool share one lock; interface calls
//! run outside it and are compensated when they fail.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ipnet::Ipv4Net;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

use crate::config::{self, ServerIdentity, Settings};
use crate::crypto::{Key, KeyProvider, OsKeyProvider};
use crate::driver::InterfaceDriver;
use crate::error::{PeerdError, Result};
use crate::pool::AddressPool;
use crate::reconciler::{LiveStats, ReconcileReport, Reconciler};
use crate::registry::{PeerRecord, PeerRegistry};

/// Longest accepted peer id
pub const MAX_ID_LEN: usize = 64;

/// Longest accepted display name
pub const MAX_NAME_LEN: usize = 128;

/// Result of a successful provisioning
#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub id: String,
    pub name: String,
    pub address: Ipv4Addr,
    pub public_key: Key,
    /// Client document, ready to import
    pub client_config: String,
}

/// A registry record merged with what the interface reports for it
#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
    pub id: String,
    pub name: String,
    pub address: Ipv4Addr,
    pub public_key: Key,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub capacity: usize,
    pub allocated: usize,
    pub free: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub public_key: Key,
    pub endpoint: String,
    pub subnet: Ipv4Net,
    pub interface: String,
    pub peer_count: usize,
    pub pool: PoolUsage,
    /// Peers currently on the interface, absent when it could not be read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_peers: Option<usize>,
    pub interface_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_error: Option<String>,
}

/// Registry change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PeerEvent {
    PeerAdded {
        id: String,
        address: Ipv4Addr,
        public_key: Key,
    },
    PeerRemoved {
        id: String,
        address: Ipv4Addr,
    },
}

struct State {
    registry: PeerRegistry,
    pool: AddressPool,
}

/// Handle to the provisioning service; clones share the same state
#[derive(Clone)]
pub struct PeerService {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    reconciler: Reconciler,
    keys: Arc<dyn KeyProvider>,
    identity: ServerIdentity,
    interface: String,
    locks: IdLocks,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerService {
    /// Assemble the service, rebuilding the pool from the registry
    ///
    /// A record whose address conflicts with another or lies outside the
    /// pool aborts startup.
    pub fn new(
        registry: PeerRegistry,
        mut pool: AddressPool,
        driver: Arc<dyn InterfaceDriver>,
        keys: Arc<dyn KeyProvider>,
        identity: ServerIdentity,
        interface: impl Into<String>,
    ) -> Result<Self> {
        for record in registry.list() {
            pool.reserve(record.address).map_err(PeerdError::Pool)?;
        }
        tracing::debug!(
            "Address pool rebuilt: {} of {} in use",
            pool.allocated_count(),
            pool.capacity()
        );

        let (events, _) = broadcast::channel(64);

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State { registry, pool }),
                reconciler: Reconciler::new(driver),
                keys,
                identity,
                interface: interface.into(),
                locks: IdLocks::default(),
                events,
            }),
        })
    }

    /// Open the registry named by `settings` and build a service around it
    pub fn open(settings: &Settings, driver: Arc<dyn InterfaceDriver>) -> Result<Self> {
        let identity = settings.server_identity()?;
        let registry = PeerRegistry::open(&settings.storage.data_dir)?;

        Self::new(
            registry,
            settings.address_pool(),
            driver,
            Arc::new(OsKeyProvider),
            identity,
            settings.interface.name.clone(),
        )
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.shared.identity
    }

    /// Receive peer_added / peer_removed notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    /// Bring the interface in line with the registry before serving
    pub async fn startup_reconcile(&self, prune: bool) -> Result<ReconcileReport> {
        let shared = &self.shared;
        let records = shared.state.lock().await.registry.list().to_vec();
        let report = shared.reconciler.reconcile(&records, prune).await?;
        tracing::info!(
            "Reconciled {}: {} pushed, {} in sync, {} pruned, {} unmanaged",
            shared.interface,
            report.pushed,
            report.in_sync,
            report.pruned,
            report.unmanaged
        );
        Ok(report)
    }

    /// Create a peer: keys, address, registry record, interface entry
    ///
    /// Runs on its own task. Dropping the returned future does not stop the
    /// work halfway.
    pub async fn provision(&self, id: &str, name: Option<&str>) -> Result<Provisioned> {
        let shared = Arc::clone(&self.shared);
        let (id, name) = (id.to_string(), name.map(str::to_string));
        let task_id = id.clone();

        let task = tokio::spawn(async move { shared.provision(&task_id, name.as_deref()).await });
        task.await.map_err(|e| aborted(id, e))?
    }

    /// Remove a peer from the interface, then from the registry
    ///
    /// Like [`PeerService::provision`], runs to completion once started.
    pub async fn revoke(&self, id: &str) -> Result<PeerRecord> {
        let shared = Arc::clone(&self.shared);
        let id = id.to_string();
        let task_id = id.clone();

        let task = tokio::spawn(async move { shared.revoke(&task_id).await });
        task.await.map_err(|e| aborted(id, e))?
    }

    pub async fn get(&self, id: &str) -> Result<PeerView> {
        let record = self.shared.state.lock().await.registry.get(id)?.clone();
        let mut live = self.live_stats().await;
        Ok(view(record, live.as_mut()))
    }

    /// Every peer in creation order
    pub async fn list(&self) -> Result<Vec<PeerView>> {
        let records = self.shared.state.lock().await.registry.list().to_vec();
        let mut live = self.live_stats().await;
        Ok(records
            .into_iter()
            .map(|record| view(record, live.as_mut()))
            .collect())
    }

    /// Re-render the client document of an existing peer
    pub async fn client_config(&self, id: &str) -> Result<String> {
        let state = self.shared.state.lock().await;
        let record = state.registry.get(id)?;
        Ok(config::render(record, &self.shared.identity))
    }

    pub async fn status(&self) -> ServerStatus {
        let shared = &self.shared;
        let (peer_count, pool) = {
            let state = shared.state.lock().await;
            (
                state.registry.len(),
                PoolUsage {
                    capacity: state.pool.capacity(),
                    allocated: state.pool.allocated_count(),
                    free: state.pool.free_count(),
                },
            )
        };

        let (live_peers, interface_error) = match shared.reconciler.snapshot().await {
            Ok(snapshot) => (Some(snapshot.len()), None),
            Err(e) => (None, Some(e.to_string())),
        };

        ServerStatus {
            public_key: shared.identity.public_key,
            endpoint: shared.identity.endpoint.clone(),
            subnet: shared.identity.subnet,
            interface: shared.interface.clone(),
            peer_count,
            pool,
            live_peers,
            interface_ok: interface_error.is_none(),
            interface_error,
        }
    }

    async fn live_stats(&self) -> Option<HashMap<Ipv4Addr, LiveStats>> {
        match self.shared.reconciler.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("Could not read interface {}: {}", self.shared.interface, e);
                None
            }
        }
    }
}

impl Shared {
    async fn provision(&self, id: &str, name: Option<&str>) -> Result<Provisioned> {
        validate_id(id)?;
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => validate_name(name)?,
            None => id.to_string(),
        };

        let _op = self.locks.acquire(id).await;

        let record = {
            let mut state = self.state.lock().await;
            if state.registry.contains(id) {
                return Err(PeerdError::DuplicateId { id: id.to_string() });
            }

            let pair = self.keys.generate()?;
            let address = state.pool.allocate()?;
            let record = PeerRecord {
                id: id.to_string(),
                name,
                address,
                public_key: pair.public_key,
                private_key: pair.private_key,
                created_at: now_secs(),
            };

            if let Err(e) = state.registry.create(record.clone()) {
                state.pool.release(address);
                return Err(e.into());
            }
            record
        };

        if let Err(e) = self.reconciler.push(&record).await {
            tracing::warn!("Interface push for peer {} failed, rolling back: {}", id, e);
            self.undo_provision(&record).await?;
            return Err(e.into());
        }

        tracing::info!("Provisioned peer {} at {}", record.id, record.address);
        let _ = self.events.send(PeerEvent::PeerAdded {
            id: record.id.clone(),
            address: record.address,
            public_key: record.public_key,
        });

        Ok(Provisioned {
            client_config: config::render(&record, &self.identity),
            id: record.id,
            name: record.name,
            address: record.address,
            public_key: record.public_key,
        })
    }

    async fn undo_provision(&self, record: &PeerRecord) -> Result<()> {
        // A failed set may still have reached the interface, so the record
        // stays until the peer is known to be gone
        if let Err(e) = self.reconciler.remove(&record.public_key).await {
            tracing::error!(
                "Peer {} may be on the interface at {} and could not be removed; record kept: {}",
                record.id,
                record.address,
                e
            );
            return Err(PeerdError::InconsistentState {
                id: record.id.clone(),
                reason: format!("interface rollback failed: {}", e),
            });
        }

        let mut state = self.state.lock().await;
        match state.registry.delete(&record.id) {
            Ok(_) => {
                state.pool.release(record.address);
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    "Peer {} is registered at {} but not on the interface; rollback failed: {}",
                    record.id,
                    record.address,
                    e
                );
                Err(PeerdError::InconsistentState {
                    id: record.id.clone(),
                    reason: format!("registry rollback failed: {}", e),
                })
            }
        }
    }

    async fn revoke(&self, id: &str) -> Result<PeerRecord> {
        let _op = self.locks.acquire(id).await;

        let public_key = self.state.lock().await.registry.get(id)?.public_key;

        self.reconciler.remove(&public_key).await?;

        let record = {
            let mut state = self.state.lock().await;
            let record = state.registry.delete(id)?;
            state.pool.release(record.address);
            record
        };

        tracing::info!("Revoked peer {} ({} released)", record.id, record.address);
        let _ = self.events.send(PeerEvent::PeerRemoved {
            id: record.id.clone(),
            address: record.address,
        });
        Ok(record)
    }
}

/// A provision or revoke task that panicked or was cancelled by the runtime
fn aborted(id: String, e: tokio::task::JoinError) -> PeerdError {
    tracing::error!("Operation on peer {} did not finish: {}", id, e);
    PeerdError::InconsistentState {
        id,
        reason: format!("operation aborted: {}", e),
    }
}

fn view(record: PeerRecord, live: Option<&mut HashMap<Ipv4Addr, LiveStats>>) -> PeerView {
    // Stats only count when the interface peer at that address is this record's key
    let live = live
        .and_then(|stats| stats.remove(&record.address))
        .filter(|stats| stats.public_key == record.public_key);

    PeerView {
        id: record.id,
        name: record.name,
        address: record.address,
        public_key: record.public_key,
        created_at: record.created_at,
        live,
    }
}

/// Ids are 1 to 64 characters of `[A-Za-z0-9_.@-]`
pub fn validate_id(id: &str) -> Result<()> {
    let invalid = |message: String| Err(PeerdError::InvalidRequest { message });

    if id.is_empty() {
        return invalid("id must not be empty".into());
    }
    if id.len() > MAX_ID_LEN {
        return invalid(format!("id must be at most {} characters", MAX_ID_LEN));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-')))
    {
        return invalid(format!("id contains invalid character {:?}", c));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<String> {
    if name.chars().count() > MAX_NAME_LEN {
        return Err(PeerdError::InvalidRequest {
            message: format!("name must be at most {} characters", MAX_NAME_LEN),
        });
    }
    if name.chars().any(char::is_control) {
        return Err(PeerdError::InvalidRequest {
            message: "name must not contain control characters".into(),
        });
    }
    Ok(name.to_string())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One async lock per peer id, dropped from the map once nobody holds or
/// waits on it
#[derive(Default)]
struct IdLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdLocks {
    async fn acquire(&self, id: &str) -> IdGuard<'_> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(id.to_string()).or_default().clone()
        };
        // Built before waiting so a dropped waiter still cleans up the entry
        let mut guard = IdGuard {
            locks: self,
            id: id.to_string(),
            lock: Arc::clone(&lock),
            guard: None,
        };
        guard.guard = Some(lock.lock_owned().await);
        guard
    }
}

struct IdGuard<'a> {
    locks: &'a IdLocks,
    id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        // Remaining references: the map entry and ours
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.id);
        }
    }
}
