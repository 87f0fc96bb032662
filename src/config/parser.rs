//! AmneziaWG configuration file parser
//!
//! Parses `.conf` files with [Interface] and [Peer] sections, including the
//! obfuscation keys AmneziaWG adds to [Interface]. Used to read the server's
//! own interface file and to check client documents produced by the renderer.

use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;

use super::obfuscation::ObfuscationParams;
use crate::crypto::Key;
use crate::error::ConfigError;

/// Complete tunnel configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub private_key: Key,
    /// Our VPN IP addresses with prefix
    pub address: Vec<ipnet::Ipv4Net>,
    /// DNS servers (optional)
    pub dns: Vec<IpAddr>,
    /// Listen port (optional, for servers)
    pub listen_port: Option<u16>,
    /// MTU (optional)
    pub mtu: Option<u16>,
    /// Obfuscation parameters, if any obfuscation key was present
    pub obfuscation: Option<ObfuscationParams>,
}

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    /// Peer's endpoint as written (`host:port`, host may be a name)
    pub endpoint: Option<String>,
    /// Allowed IP ranges for this peer
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds (optional)
    pub persistent_keepalive: Option<u16>,
}

impl TunnelConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
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

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceBuilder> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_section: Option<Section> = None;

        // Temporary storage for current peer being parsed
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Check for section headers
            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::default());
                continue;
            }

            // Parse key = value pairs
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => {
                    let iface = interface.get_or_insert_with(InterfaceBuilder::default);

                    match key.as_str() {
                        "privatekey" => {
                            iface.private_key = Some(parse_key(value, "PrivateKey")?);
                        }
                        "address" => {
                            for addr_str in value.split(',') {
                                let addr_str = addr_str.trim();
                                if addr_str.is_empty() {
                                    continue;
                                }
                                let ip_net: IpNet =
                                    addr_str.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: addr_str.to_string(),
                                    })?;
                                if let IpNet::V4(v4net) = ip_net {
                                    iface.address.push(v4net);
                                }
                            }
                        }
                        "dns" => {
                            for dns_str in value.split(',') {
                                let dns_str = dns_str.trim();
                                let dns: IpAddr =
                                    dns_str.parse().map_err(|_| ConfigError::InvalidAddress {
                                        value: dns_str.to_string(),
                                    })?;
                                iface.dns.push(dns);
                            }
                        }
                        "listenport" => {
                            iface.listen_port = Some(value.parse().map_err(|_| {
                                ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid ListenPort: {}", value),
                                }
                            })?);
                        }
                        "mtu" => {
                            iface.mtu =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid MTU: {}", value),
                                })?);
                        }
                        _ => {
                            let obfuscation = iface
                                .obfuscation
                                .get_or_insert_with(ObfuscationParams::disabled);
                            let known = obfuscation.set(&key, value).map_err(|message| {
                                ConfigError::ParseError {
                                    line: line_num,
                                    message,
                                }
                            })?;
                            if !known {
                                // Unknown key, ignore (forward compatibility)
                                tracing::debug!("Unknown interface key: {}", key);
                                if *obfuscation == ObfuscationParams::disabled() {
                                    iface.obfuscation = None;
                                }
                            }
                        }
                    }
                }
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "publickey" => {
                            peer.public_key = Some(parse_key(value, "PublicKey")?);
                        }
                        "presharedkey" => {
                            peer.preshared_key = Some(parse_key(value, "PresharedKey")?);
                        }
                        "endpoint" => {
                            peer.endpoint = Some(parse_endpoint(value)?);
                        }
                        "allowedips" => {
                            for ip_str in value.split(',') {
                                let ip_str = ip_str.trim();
                                if ip_str.is_empty() {
                                    continue;
                                }
                                let ip: IpNet =
                                    ip_str.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: ip_str.to_string(),
                                    })?;
                                peer.allowed_ips.push(ip);
                            }
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid PersistentKeepalive: {}", value),
                                })?);
                        }
                        _ => {
                            tracing::debug!("Unknown peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        // Save any pending peer
        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let interface = interface
            .ok_or(ConfigError::MissingField {
                field: "[Interface] section".to_string(),
            })?
            .build()?;

        Ok(TunnelConfig { interface, peers })
    }

    /// Our public key derived from the private key
    pub fn public_key(&self) -> Key {
        self.interface.private_key.public_key()
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

#[derive(Default)]
struct InterfaceBuilder {
    private_key: Option<Key>,
    address: Vec<ipnet::Ipv4Net>,
    dns: Vec<IpAddr>,
    listen_port: Option<u16>,
    mtu: Option<u16>,
    obfuscation: Option<ObfuscationParams>,
}

impl InterfaceBuilder {
    fn build(self) -> Result<InterfaceConfig, ConfigError> {
        let private_key = self.private_key.ok_or(ConfigError::MissingField {
            field: "PrivateKey".to_string(),
        })?;

        Ok(InterfaceConfig {
            private_key,
            address: self.address,
            dns: self.dns,
            listen_port: self.listen_port,
            mtu: self.mtu,
            obfuscation: self.obfuscation,
        })
    }
}

/// Builder for PeerConfig during parsing
#[derive(Default)]
struct PeerBuilder {
    public_key: Option<Key>,
    preshared_key: Option<Key>,
    endpoint: Option<String>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

/// Parse a base64-encoded 32-byte key
fn parse_key(value: &str, field_name: &str) -> Result<Key, ConfigError> {
    Key::from_base64(value).map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })
}

/// Validate an endpoint of the form `host:port` or `[v6]:port`
pub fn parse_endpoint(value: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidAddress {
        value: value.to_string(),
    };

    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().map_or(true, |p| p == 0) {
        return Err(invalid());
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid());
    }
    Ok(value.to_string())
}
