//! Error types for the claim core

use crate::types::{Hash, InstanceId, LedgerId, ParticipantId, SnapId};
use thiserror::Error;

/// Result type for claim operations
pub type Result<T> = std::result::Result<T, Error>;

/// Claim core errors
///
/// The first block of variants is the stable taxonomy surfaced to callers. A
/// rejected operation leaves no partial state behind.
#[derive(Error, Debug)]
pub enum Error {
    /// An instance already occupies the derived identity
    #[error("Instance already provisioned: {0}")]
    AlreadyProvisioned(InstanceId),

    /// One-shot initialization attempted twice
    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    /// Leaf/proof does not resolve to the committed root
    #[error("Invalid proof for leaf {}", hex::encode(.0))]
    InvalidProof(Hash),

    /// Leaf already present in the claimed set
    #[error("Leaf already claimed: {}", hex::encode(.0))]
    AlreadyClaimed(Hash),

    /// Zero computed entitlement or already claimed (snapshot path)
    #[error("No allocation for {participant} in snapshot {snap_id}")]
    NoAllocation {
        /// Snapshot the claim targeted
        snap_id: SnapId,
        /// Beneficiary of the claim
        participant: ParticipantId,
    },

    /// Pool holds less than the declared allocation
    #[error("Insufficient custody on {ledger}: required {required}, available {available}")]
    InsufficientCustody {
        /// Pool ledger
        ledger: LedgerId,
        /// Declared allocation
        required: u128,
        /// Balance actually custodied
        available: u128,
    },

    /// Privileged operation without the required role
    #[error("{caller} is not authorized to call {operation} on {target}")]
    NotAuthorized {
        /// Caller identity
        caller: ParticipantId,
        /// Target instance
        target: InstanceId,
        /// Operation selector
        operation: String,
    },

    /// Instance not found
    #[error("Instance not found: {0}")]
    UnknownInstance(InstanceId),

    /// Snapshot record not found
    #[error("Snapshot {snap_id} not found on {instance}")]
    UnknownSnapshot {
        /// Distributor instance
        instance: InstanceId,
        /// Requested snapshot
        snap_id: SnapId,
    },

    /// Ledger not registered with the engine
    #[error("Ledger not registered: {0}")]
    UnknownLedger(LedgerId),

    /// Operation does not apply to this distributor variant
    #[error("Instance {instance} is a {actual} distributor, expected {expected}")]
    KindMismatch {
        /// Distributor instance
        instance: InstanceId,
        /// Variant the operation requires
        expected: &'static str,
        /// Variant actually installed
        actual: &'static str,
    },

    /// Instance or factory used before initialization
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Malformed configuration or init arguments
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Fungible ledger rejected an operation
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Arithmetic overflow
    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable short code, used as a metrics label
    pub fn code(&self) -> &'static str {
        match self {
            Error::AlreadyProvisioned(_) => "already_provisioned",
            Error::AlreadyInitialized(_) => "already_initialized",
            Error::InvalidProof(_) => "invalid_proof",
            Error::AlreadyClaimed(_) => "already_claimed",
            Error::NoAllocation { .. } => "no_allocation",
            Error::InsufficientCustody { .. } => "insufficient_custody",
            Error::NotAuthorized { .. } => "not_authorized",
            Error::UnknownInstance(_) => "unknown_instance",
            Error::UnknownSnapshot { .. } => "unknown_snapshot",
            Error::UnknownLedger(_) => "unknown_ledger",
            Error::KindMismatch { .. } => "kind_mismatch",
            Error::NotInitialized(_) => "not_initialized",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Ledger(_) => "ledger",
            Error::Overflow(_) => "overflow",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let leaf = [7u8; 32];
        let participant = ParticipantId::from_bytes([1u8; 32]);
        let codes = [
            Error::AlreadyProvisioned(InstanceId::from_bytes([0u8; 32])).code(),
            Error::AlreadyInitialized("x".into()).code(),
            Error::InvalidProof(leaf).code(),
            Error::AlreadyClaimed(leaf).code(),
            Error::NoAllocation { snap_id: 1, participant }.code(),
            Error::InsufficientCustody {
                ledger: LedgerId::new("DCNT"),
                required: 1,
                available: 0,
            }
            .code(),
        ];
        let mut dedup = codes.to_vec();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), codes.len());
    }

    #[test]
    fn test_invalid_proof_message_contains_leaf() {
        let err = Error::InvalidProof([0xab; 32]);
        assert!(err.to_string().contains("abab"));
    }
}
