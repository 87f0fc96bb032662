//! Configuration
//!
//! Daemon settings (TOML), the wg-quick style `.conf` format used both for
//! reading the server's interface file and for client documents, and the
//! AmneziaWG obfuscation parameters shared by the two.

mod obfuscation;
mod parser;
mod render;
mod settings;

pub use obfuscation::ObfuscationParams;
pub use parser::{parse_endpoint, InterfaceConfig, PeerConfig, TunnelConfig};
pub use render::{render, ServerIdentity};
pub use settings::{
    ApiSettings, DriverKind, InterfaceSettings, NetworkSettings, ServerSettings, Settings,
    StorageSettings, DEFAULT_CONFIG_PATH,
};
