//! Peer key material
//!
//! - X25519 key generation and public key derivation (x25519)
//! - The `Key` type used for storage and transport (base64 text form)
//! - The `KeyProvider` seam the peer service draws new key pairs from

pub mod x25519;

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CryptoError;
use x25519::KEY_LEN;

/// A 32-byte X25519 key, carried as standard base64 outside the process
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(value: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(value.trim())
            .map_err(|_| CryptoError::InvalidKeyEncoding)?;
        let bytes: [u8; KEY_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LEN,
                    got: bytes.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Treat this key as a private key and derive its public half
    pub fn public_key(&self) -> Key {
        Key(x25519::public_key(&self.0))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Enough to tell keys apart in logs
        let encoded = self.to_base64();
        write!(f, "Key({}..)", &encoded[..8])
    }
}

impl std::str::FromStr for Key {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Key::from_base64(&value).map_err(serde::de::Error::custom)
    }
}

/// A freshly generated peer key pair
#[derive(Clone)]
pub struct KeyPair {
    pub private_key: Key,
    pub public_key: Key,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Source of new peer key pairs
pub trait KeyProvider: Send + Sync {
    fn generate(&self) -> Result<KeyPair, CryptoError>;
}

/// Key provider backed by the operating system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeyProvider;

impl KeyProvider for OsKeyProvider {
    fn generate(&self) -> Result<KeyPair, CryptoError> {
        let (private, public) = x25519::generate_keypair()?;
        Ok(KeyPair {
            private_key: Key(private),
            public_key: Key(public),
        })
    }
}

/// Reproducible key pairs for tests: the n-th call is seeded with n
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct SequentialKeyProvider {
    counter: std::sync::atomic::AtomicU8,
}

#[cfg(test)]
impl KeyProvider for SequentialKeyProvider {
    fn generate(&self) -> Result<KeyPair, CryptoError> {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (private, public) = x25519::keypair_from_seed([n.wrapping_add(1); KEY_LEN]);
        Ok(KeyPair {
            private_key: Key(private),
            public_key: Key(public),
        })
    }
}
