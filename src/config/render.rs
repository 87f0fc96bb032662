//! Client configuration documents
//!
//! Turns a peer record and the server identity into the `.conf` text a
//! client imports. Pure formatting: no I/O, no key generation.

use std::fmt::Write;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net};
use serde::Serialize;

use super::obfuscation::ObfuscationParams;
use crate::crypto::Key;
use crate::registry::PeerRecord;

/// Server-side parameters a client needs to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerIdentity {
    pub public_key: Key,
    /// `host:port` clients dial
    pub endpoint: String,
    pub subnet: Ipv4Net,
    #[serde(skip)]
    pub dns: Vec<IpAddr>,
    #[serde(skip)]
    pub client_allowed_ips: Vec<IpNet>,
    /// Seconds, 0 disables keepalive
    #[serde(skip)]
    pub persistent_keepalive: u16,
    #[serde(skip)]
    pub obfuscation: ObfuscationParams,
}

/// Render the client document for `record`
pub fn render(record: &PeerRecord, identity: &ServerIdentity) -> String {
    let mut doc = String::new();

    // Writing into a String cannot fail
    let _ = writeln!(doc, "[Interface]");
    let _ = writeln!(doc, "PrivateKey = {}", record.private_key);
    let _ = writeln!(doc, "Address = {}/32", record.address);
    if !identity.dns.is_empty() {
        let _ = writeln!(doc, "DNS = {}", join(&identity.dns));
    }
    for (key, value) in identity.obfuscation.entries() {
        let _ = writeln!(doc, "{} = {}", key, value);
    }

    let _ = writeln!(doc);
    let _ = writeln!(doc, "[Peer]");
    let _ = writeln!(doc, "PublicKey = {}", identity.public_key);
    let _ = writeln!(doc, "Endpoint = {}", identity.endpoint);
    let _ = writeln!(doc, "AllowedIPs = {}", join(&identity.client_allowed_ips));
    if identity.persistent_keepalive > 0 {
        let _ = writeln!(doc, "PersistentKeepalive = {}", identity.persistent_keepalive);
    }

    doc
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use crate::crypto::{KeyProvider, OsKeyProvider};
    use std::net::Ipv4Addr;

    fn identity() -> ServerIdentity {
        let mut obfuscation = ObfuscationParams::default();
        obfuscation.s1 = 15;
        obfuscation.h1 = Some("1106457265".into());
        obfuscation.i1 = Some("<b 0xc700000001>".into());

        ServerIdentity {
            public_key: OsKeyProvider.generate().unwrap().public_key,
            endpoint: "vpn.example.com:51820".into(),
            subnet: "10.8.0.0/24".parse().unwrap(),
            dns: vec!["1.1.1.1".parse().unwrap()],
            client_allowed_ips: vec!["0.0.0.0/0".parse().unwrap()],
            persistent_keepalive: 25,
            obfuscation,
        }
    }

    fn record() -> PeerRecord {
        let pair = OsKeyProvider.generate().unwrap();
        PeerRecord {
            id: "alice".into(),
            name: "Alice".into(),
            address: Ipv4Addr::new(10, 8, 0, 2),
            public_key: pair.public_key,
            private_key: pair.private_key,
            created_at: 0,
        }
    }

    #[test]
    fn test_render_layout() {
        let identity = identity();
        let record = record();
        let doc = render(&record, &identity);

        let expected_head = format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.8.0.2/32\nDNS = 1.1.1.1\nJc = 6\nJmin = 50\nJmax = 1000\nS1 = 15\nS2 = 0\nS3 = 0\nS4 = 0\nH1 = 1106457265\nI1 = <b 0xc700000001>\n\n[Peer]\n",
            record.private_key
        );
        assert!(doc.starts_with(&expected_head), "{}", doc);
        assert!(doc.ends_with("AllowedIPs = 0.0.0.0/0\nPersistentKeepalive = 25\n"));
    }

    #[test]
    fn test_rendered_document_parses_back_symmetrically() {
        let identity = identity();
        let record = record();
        let parsed = TunnelConfig::parse(&render(&record, &identity)).unwrap();

        assert_eq!(parsed.interface.private_key, record.private_key);
        assert_eq!(parsed.public_key(), record.public_key);
        assert_eq!(parsed.interface.address[0].addr(), record.address);
        assert_eq!(parsed.interface.obfuscation.as_ref(), Some(&identity.obfuscation));

        let server = &parsed.peers[0];
        assert_eq!(server.public_key, identity.public_key);
        assert_eq!(server.endpoint.as_deref(), Some(identity.endpoint.as_str()));
        assert_eq!(server.allowed_ips, identity.client_allowed_ips);
    }

    #[test]
    fn test_optional_lines_omitted() {
        let mut identity = identity();
        identity.dns.clear();
        identity.persistent_keepalive = 0;
        identity.client_allowed_ips = vec![
            "10.8.0.0/24".parse().unwrap(),
            "192.168.10.0/24".parse().unwrap(),
        ];

        let doc = render(&record(), &identity);
        assert!(!doc.contains("DNS"));
        assert!(!doc.contains("PersistentKeepalive"));
        assert!(doc.contains("AllowedIPs = 10.8.0.0/24, 192.168.10.0/24\n"));
    }
}
