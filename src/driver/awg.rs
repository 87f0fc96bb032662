//! Interface driver backed by the `awg` (or `wg`) command line tool
//!
//! Peers are changed with `awg set <iface> peer ...` and read back with
//! `awg show <iface> dump`. The dump is tab separated: one interface line,
//! then one line per peer:
//!
//! ```text
//! public-key  preshared-key  endpoint  allowed-ips  latest-handshake  rx  tx  keepalive
//! ```
//!
//! `(none)` marks a missing endpoint or empty allowed-ips list and a
//! handshake time of `0` means the peer never completed one.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::process::Command;

use super::{DriverPeer, InterfaceDriver};
use crate::crypto::Key;
use crate::error::DriverError;

/// Number of tab separated fields on a peer line
const PEER_FIELDS: usize = 8;

/// Drives one interface through the tunnel's userspace tool
#[derive(Debug, Clone)]
pub struct AwgDriver {
    tool: String,
    interface: String,
}

impl AwgDriver {
    pub fn new(tool: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            interface: interface.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Run the tool and return stdout, failing on non-zero exit
    async fn run(&self, args: &[&str]) -> Result<String, DriverError> {
        let command = format!("{} {}", self.tool, args.join(" "));
        tracing::debug!("Running: {}", command);

        let output = Command::new(&self.tool)
            .args(args)
            .output()
            .await
            .map_err(|e| DriverError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(DriverError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl InterfaceDriver for AwgDriver {
    async fn set_peer(&self, public_key: &Key, allowed: Ipv4Addr) -> Result<(), DriverError> {
        let key = public_key.to_base64();
        let allowed = format!("{}/32", allowed);
        self.run(&["set", &self.interface, "peer", &key, "allowed-ips", &allowed])
            .await?;
        Ok(())
    }

    async fn remove_peer(&self, public_key: &Key) -> Result<(), DriverError> {
        let key = public_key.to_base64();
        self.run(&["set", &self.interface, "peer", &key, "remove"])
            .await?;
        Ok(())
    }

    async fn dump_peers(&self) -> Result<Vec<DriverPeer>, DriverError> {
        let output = self.run(&["show", &self.interface, "dump"]).await?;
        parse_dump(&output)
    }
}

/// Parse the output of `awg show <iface> dump`
pub fn parse_dump(output: &str) -> Result<Vec<DriverPeer>, DriverError> {
    let mut peers = Vec::new();

    // The first line describes the interface itself
    for (index, line) in output.lines().enumerate().skip(1) {
        let line_num = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        peers.push(parse_peer_line(line_num, line)?);
    }

    Ok(peers)
}

fn parse_peer_line(line_num: usize, line: &str) -> Result<DriverPeer, DriverError> {
    let malformed = |reason: String| DriverError::MalformedDump {
        line: line_num,
        reason,
    };

    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < PEER_FIELDS {
        return Err(malformed(format!(
            "expected {} fields, got {}",
            PEER_FIELDS,
            fields.len()
        )));
    }

    let public_key = Key::from_base64(fields[0])
        .map_err(|e| malformed(format!("public key: {}", e)))?;

    let endpoint = match fields[2] {
        "(none)" => None,
        value => Some(
            value
                .parse::<SocketAddr>()
                .map_err(|_| malformed(format!("endpoint: {}", value)))?,
        ),
    };

    let allowed_ips: Vec<IpNet> = match fields[3] {
        "(none)" | "" => Vec::new(),
        value => value
            .split(',')
            .map(|ip| {
                ip.trim()
                    .parse::<IpNet>()
                    .map_err(|_| malformed(format!("allowed ip: {}", ip)))
            })
            .collect::<Result<_, _>>()?,
    };

    let number = |value: &str, field: &str| {
        value
            .parse::<u64>()
            .map_err(|_| malformed(format!("{}: {}", field, value)))
    };

    let last_handshake = match number(fields[4], "latest handshake")? {
        0 => None,
        secs => Some(secs),
    };

    Ok(DriverPeer {
        public_key,
        allowed_ips,
        endpoint,
        last_handshake,
        rx_bytes: number(fields[5], "transfer rx")?,
        tx_bytes: number(fields[6], "transfer tx")?,
    })
}
