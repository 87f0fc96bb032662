//! awg-peerd - AmneziaWG peer provisioning daemon
//!
//! Hands out client identities on a single AmneziaWG server: allocates a
//! tunnel address, generates an X25519 key pair, records the peer durably,
//! pushes it onto the live interface and renders the client `.conf`.
//!
//! # Features
//!
//! - Lowest-free address allocation from a configured subnet
//! - Durable JSON peer registry with atomic writes
//! - Interface driver over the `awg`/`wg` tool, plus an in-memory driver
//! - Startup reconciliation of the interface against the registry
//! - REST API with API key auth and an SSE event stream
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use awg_peerd::{MemoryDriver, PeerService, Settings};
//!
//! #[tokio::main]
//! async fn main() -> awg_peerd::Result<()> {
//!     let settings = Settings::load(Path::new("/etc/awg-peerd/config.toml"))?;
//!     let service = PeerService::open(&settings, Arc::new(MemoryDriver::new()))?;
//!     let peer = service.provision("alice", Some("Alice's laptop")).await?;
//!     println!("{}", peer.client_config);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod pool;
pub mod reconciler;
pub mod registry;
pub mod service;

pub use config::{ServerIdentity, Settings, TunnelConfig};
pub use crypto::{Key, KeyPair, KeyProvider, OsKeyProvider};
pub use daemon::DaemonService;
pub use driver::{AwgDriver, InterfaceDriver, MemoryDriver};
pub use error::{PeerdError, Result};
pub use pool::AddressPool;
pub use registry::{PeerRecord, PeerRegistry};
pub use service::{PeerService, PeerView, Provisioned, ServerStatus};
