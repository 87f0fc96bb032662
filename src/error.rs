//! Error types for the awg-peerd provisioning daemon

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Main error type for awg-peerd
#[derive(Error, Debug)]
pub enum PeerdError {
    /// Request rejected before any side effect
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Peer {id} already exists")]
    DuplicateId { id: String },

    #[error("Address {address} is already assigned to another peer")]
    DuplicateAddress { address: Ipv4Addr },

    #[error("No free addresses left in {subnet}")]
    PoolExhausted { subnet: String },

    #[error("Peer {id} not found")]
    NotFound { id: String },

    /// Interface driver errors
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Durable storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Registry and live interface disagree and automatic repair failed
    #[error("Inconsistent state for peer {id}: {reason}")]
    InconsistentState { id: String, reason: String },

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Address pool could not be rebuilt from the registry
    #[error("Address pool error: {0}")]
    Pool(PoolError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Stable, machine-readable error kinds for API consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    DuplicateId,
    DuplicateAddress,
    PoolExhausted,
    NotFound,
    DriverFailure,
    CryptoFailure,
    StorageFailure,
    InconsistentState,
    Config,
    PoolConflict,
    System,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::DuplicateId => "duplicate_id",
            Self::DuplicateAddress => "duplicate_address",
            Self::PoolExhausted => "pool_exhausted",
            Self::NotFound => "not_found",
            Self::DriverFailure => "driver_failure",
            Self::CryptoFailure => "crypto_failure",
            Self::StorageFailure => "storage_failure",
            Self::InconsistentState => "inconsistent_state",
            Self::Config => "config",
            Self::PoolConflict => "pool_conflict",
            Self::System => "system",
        }
    }
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key generation and encoding errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Secure random source failed: {reason}")]
    RandomSource { reason: String },

    #[error("Invalid key encoding: expected base64")]
    InvalidKeyEncoding,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Address pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Address pool {subnet} is exhausted")]
    Exhausted { subnet: String },

    #[error("Address {address} is already allocated")]
    Conflict { address: Ipv4Addr },

    #[error("Address {address} is outside the usable range of {subnet}")]
    OutOfRange { address: Ipv4Addr, subnet: String },
}

/// Durable storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt registry file {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// External interface driver errors
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to run {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Malformed peer dump at line {line}: {reason}")]
    MalformedDump { line: usize, reason: String },
}

/// Peer registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Peer {id} already exists")]
    DuplicateId { id: String },

    #[error("Address {address} is already assigned to peer {owner}")]
    DuplicateAddress { address: Ipv4Addr, owner: String },

    #[error("Peer {id} not found")]
    NotFound { id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<RegistryError> for PeerdError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateId { id } => Self::DuplicateId { id },
            RegistryError::DuplicateAddress { address, .. } => Self::DuplicateAddress { address },
            RegistryError::NotFound { id } => Self::NotFound { id },
            RegistryError::Storage(e) => Self::Storage(e),
        }
    }
}

impl From<PoolError> for PeerdError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { subnet } => Self::PoolExhausted { subnet },
            other => Self::Pool(other),
        }
    }
}

impl PeerdError {
    /// Stable kind used by the API layer to pick a response
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::DuplicateId { .. } => ErrorKind::DuplicateId,
            Self::DuplicateAddress { .. } => ErrorKind::DuplicateAddress,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Driver(_) => ErrorKind::DriverFailure,
            Self::Crypto(_) => ErrorKind::CryptoFailure,
            Self::Storage(_) => ErrorKind::StorageFailure,
            Self::InconsistentState { .. } => ErrorKind::InconsistentState,
            Self::Config(_) => ErrorKind::Config,
            Self::Pool(_) => ErrorKind::PoolConflict,
            Self::System(_) => ErrorKind::System,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Storage(_) | Self::Pool(_) => 2,
            Self::Driver(_) => 3,
            Self::InconsistentState { .. } => 4,
            Self::Crypto(_) => 5,
            _ => 255,
        }
    }
}

/// Result type alias for awg-peerd operations
pub type Result<T> = std::result::Result<T, PeerdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_errors_map_to_distinct_kinds() {
        let dup: PeerdError = RegistryError::DuplicateId { id: "alice".into() }.into();
        assert_eq!(dup.kind(), ErrorKind::DuplicateId);

        let addr: PeerdError = RegistryError::DuplicateAddress {
            address: Ipv4Addr::new(10, 8, 0, 2),
            owner: "bob".into(),
        }
        .into();
        assert_eq!(addr.kind(), ErrorKind::DuplicateAddress);

        let missing: PeerdError = RegistryError::NotFound { id: "carol".into() }.into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_pool_exhaustion_is_not_a_conflict() {
        let exhausted: PeerdError = PoolError::Exhausted {
            subnet: "10.8.0.0/24".into(),
        }
        .into();
        assert_eq!(exhausted.kind(), ErrorKind::PoolExhausted);

        let conflict: PeerdError = PoolError::Conflict {
            address: Ipv4Addr::new(10, 8, 0, 9),
        }
        .into();
        assert_eq!(conflict.kind(), ErrorKind::PoolConflict);
        assert_eq!(conflict.exit_code(), 2);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DriverFailure).unwrap();
        assert_eq!(json, "\"driver_failure\"");
        assert_eq!(ErrorKind::DriverFailure.as_str(), "driver_failure");
    }
}
