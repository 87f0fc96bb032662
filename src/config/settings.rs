//! Daemon settings
//!
//! Loaded from a TOML file. Every section except `[server]` is optional and
//! falls back to the defaults of a stock single-server AmneziaWG deployment
//! (`awg0`, `10.8.0.0/24`, API on port 8080).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use super::obfuscation::ObfuscationParams;
use super::parser::{parse_endpoint, TunnelConfig};
use super::render::ServerIdentity;
use crate::crypto::Key;
use crate::error::ConfigError;
use crate::pool::AddressPool;

/// Default settings file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/awg-peerd/config.toml";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Public identity of the tunnel server
    pub server: ServerSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    /// Copied verbatim into client documents
    #[serde(default)]
    pub obfuscation: ObfuscationParams,

    #[serde(default)]
    pub interface: InterfaceSettings,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// `host:port` clients dial; the port may be omitted when
    /// `interface_config` provides a ListenPort
    pub endpoint: String,

    /// Server public key (base64)
    #[serde(default)]
    pub public_key: Option<Key>,

    /// The server's own interface file, e.g. `/etc/amneziawg/awg0.conf`
    #[serde(default)]
    pub interface_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Tunnel subnet peers are addressed from
    #[serde(default = "default_subnet")]
    pub subnet: Ipv4Net,

    /// The server's own tunnel address (default: first host of the subnet)
    #[serde(default)]
    pub server_address: Option<Ipv4Addr>,

    /// Lowest address handed to peers
    #[serde(default)]
    pub pool_start: Option<Ipv4Addr>,

    /// DNS servers written into client documents
    #[serde(default = "default_dns")]
    pub dns: Vec<IpAddr>,

    /// Routes clients send through the tunnel
    #[serde(default = "default_client_allowed_ips")]
    pub client_allowed_ips: Vec<IpNet>,

    /// Client keepalive interval in seconds, 0 to disable
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            subnet: default_subnet(),
            server_address: None,
            pool_start: None,
            dns: default_dns(),
            client_allowed_ips: default_client_allowed_ips(),
            persistent_keepalive: default_keepalive(),
        }
    }
}

/// Which interface driver the daemon talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Real interface through the `awg`/`wg` tool
    Awg,
    /// In-process peer table, no interface required
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSettings {
    #[serde(default = "default_interface")]
    pub name: String,

    #[serde(default = "default_driver")]
    pub driver: DriverKind,

    /// Binary used by the awg driver
    #[serde(default = "default_tool")]
    pub tool: String,

    /// Push every registered peer to the interface before serving
    #[serde(default = "default_true")]
    pub reconcile_on_start: bool,

    /// Remove interface peers the registry doesn't know about
    #[serde(default)]
    pub prune_unknown: bool,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            name: default_interface(),
            driver: default_driver(),
            tool: default_tool(),
            reconcile_on_start: true,
            prune_unknown: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Empty or absent: generate a token at startup and write it to `token_path`
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_key: None,
            token_path: default_token_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_subnet() -> Ipv4Net { Ipv4Net::new(Ipv4Addr::new(10, 8, 0, 0), 24).unwrap_or_default() }
fn default_dns() -> Vec<IpAddr> { vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))] }
fn default_client_allowed_ips() -> Vec<IpNet> { vec![IpNet::V4(Ipv4Net::default())] }
fn default_keepalive() -> u16 { 25 }
fn default_interface() -> String { "awg0".into() }
fn default_driver() -> DriverKind { DriverKind::Awg }
fn default_tool() -> String { "awg".into() }
fn default_true() -> bool { true }
fn default_listen() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8080)) }
fn default_token_path() -> PathBuf { PathBuf::from("/var/lib/awg-peerd/api-token") }
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/awg-peerd") }

impl Settings {
    /// Load and validate settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse and validate settings from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content).map_err(|e| {
            let line = e
                .span()
                .map(|span| content[..span.start].matches('\n').count() + 1)
                .unwrap_or(0);
            ConfigError::ParseError {
                line,
                message: e.message().to_string(),
            }
        })?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        let subnet = net.subnet.trunc();

        if subnet.prefix_len() > 30 {
            return Err(ConfigError::InvalidValue {
                field: "network.subnet".into(),
                message: format!("{} leaves no room for peers", net.subnet),
            });
        }

        let server = self.server_address();
        if !subnet.contains(&server) || server == subnet.network() || server == subnet.broadcast() {
            return Err(ConfigError::InvalidValue {
                field: "network.server_address".into(),
                message: format!("{} is not a host address of {}", server, subnet),
            });
        }

        if let Some(start) = net.pool_start {
            if !subnet.contains(&start) {
                return Err(ConfigError::InvalidValue {
                    field: "network.pool_start".into(),
                    message: format!("{} is outside {}", start, subnet),
                });
            }
        }

        if self.address_pool().capacity() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "network".into(),
                message: "address pool is empty".into(),
            });
        }

        if self.server.public_key.is_none() && self.server.interface_config.is_none() {
            return Err(ConfigError::MissingField {
                field: "server.public_key or server.interface_config".into(),
            });
        }

        if self.interface.name.is_empty() {
            return Err(ConfigError::MissingField {
                field: "interface.name".into(),
            });
        }

        self.obfuscation
            .validate()
            .map_err(|message| ConfigError::InvalidValue {
                field: "obfuscation".into(),
                message,
            })
    }

    /// The server's tunnel address, explicit or the first host of the subnet
    pub fn server_address(&self) -> Ipv4Addr {
        self.network.server_address.unwrap_or_else(|| {
            let network = u32::from(self.network.subnet.trunc().network());
            Ipv4Addr::from(network + 1)
        })
    }

    /// An empty pool over the configured range
    pub fn address_pool(&self) -> AddressPool {
        AddressPool::new(
            self.network.subnet,
            self.server_address(),
            self.network.pool_start,
        )
    }

    /// API key to require, if one is configured
    pub fn api_key(&self) -> Option<&str> {
        self.api
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    /// Resolve what clients need to know about the server
    ///
    /// With `interface_config`, the interface file is authoritative for the
    /// public key, the listen port (when the endpoint has none) and the
    /// obfuscation parameters, so documents match what the interface runs.
    pub fn server_identity(&self) -> Result<ServerIdentity, ConfigError> {
        let mut public_key = self.server.public_key;
        let mut endpoint = self.server.endpoint.trim().to_string();
        let mut obfuscation = self.obfuscation.clone();

        if let Some(path) = &self.server.interface_config {
            let iface = TunnelConfig::from_file(path)?;
            let derived = iface.public_key();

            if let Some(configured) = public_key {
                if configured != derived {
                    return Err(ConfigError::InvalidValue {
                        field: "server.public_key".into(),
                        message: format!("does not match the private key in {}", path.display()),
                    });
                }
            }
            public_key = Some(derived);

            if parse_endpoint(&endpoint).is_err() {
                if let Some(port) = iface.interface.listen_port {
                    endpoint = format!("{}:{}", endpoint, port);
                }
            }

            if let Some(params) = iface.interface.obfuscation {
                obfuscation = params;
            }
            tracing::debug!("Server identity derived from {}", path.display());
        }

        let public_key = public_key.ok_or(ConfigError::MissingField {
            field: "server.public_key".into(),
        })?;
        let endpoint = parse_endpoint(&endpoint)?;

        Ok(ServerIdentity {
            public_key,
            endpoint,
            subnet: self.network.subnet.trunc(),
            dns: self.network.dns.clone(),
            client_allowed_ips: self.network.client_allowed_ips.clone(),
            persistent_keepalive: self.network.persistent_keepalive,
            obfuscation,
        })
    }
}
