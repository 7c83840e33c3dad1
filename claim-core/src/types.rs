//! Core types for the claim core
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Fixed-width identities usable directly as storage keys
//! - Exact integer arithmetic (smallest indivisible unit of a ledger)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 32-byte SHA-256 digest
pub type Hash = [u8; 32];

/// Caller-chosen salt mixed into instance identities
pub type Salt = [u8; 32];

/// Amount of value in the smallest indivisible unit of a ledger
pub type Entitlement = u128;

/// Distributor-local snapshot sequence number (first is 1)
pub type SnapId = u64;

/// Snapshot identifier issued by a reference ledger
pub type LedgerSnapshotId = u64;

macro_rules! fixed_width_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create from raw bytes
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get raw bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Parse from hex (with or without `0x` prefix)
            pub fn from_hex(s: &str) -> Option<Self> {
                let raw = hex::decode(s.trim_start_matches("0x")).ok()?;
                let bytes: [u8; 32] = raw.try_into().ok()?;
                Some(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }
    };
}

fixed_width_id!(
    /// Opaque account identifier (holder, claimant, caller)
    ParticipantId
);

fixed_width_id!(
    /// Identity of a provisioned distributor instance (or of the factory)
    InstanceId
);

impl InstanceId {
    /// The account under which this instance custodies pool balances
    pub fn as_participant(&self) -> ParticipantId {
        ParticipantId::from_bytes(self.0)
    }
}

/// Ledger identifier (symbol or registry key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerId(String);

impl LedgerId {
    /// Create new ledger ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Claim variant installed at an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DistributorKind {
    /// Allow-list claims against a Merkle root
    Merkle = 1,
    /// Pro-rata claims against reference-ledger snapshots
    Snapshot = 2,
}

impl DistributorKind {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            DistributorKind::Merkle => "merkle",
            DistributorKind::Snapshot => "snapshot",
        }
    }

    /// Code identity of the built-in logic for this variant
    pub fn code_identity(&self) -> Hash {
        match self {
            DistributorKind::Merkle => crate::crypto::code_identity("MerkleClaimDistributor/v1"),
            DistributorKind::Snapshot => crate::crypto::code_identity("SnapshotClaimDistributor/v1"),
        }
    }

    /// Resolve a code identity back to its variant
    pub fn from_code_identity(code: &Hash) -> Option<Self> {
        [DistributorKind::Merkle, DistributorKind::Snapshot]
            .into_iter()
            .find(|kind| &kind.code_identity() == code)
    }
}

impl fmt::Display for DistributorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Typed initialization arguments, encoded into a provisioning request's
/// `init_args` bytes by [`DistributorConfig::encode`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributorConfig {
    /// Merkle allow-list distributor
    Merkle {
        /// Committed root over `(participant, entitlement)` leaves
        root: Hash,
        /// Ledger whose balance the instance custodies
        pool_ledger: LedgerId,
        /// Declared total of all entitlements
        total_allocation: Entitlement,
    },
    /// Snapshot pro-rata distributor
    Snapshot {
        /// Ledger whose historical balances weight each claim
        reference_ledger: LedgerId,
    },
}

impl DistributorConfig {
    /// Variant this configuration installs
    pub fn kind(&self) -> DistributorKind {
        match self {
            DistributorConfig::Merkle { .. } => DistributorKind::Merkle,
            DistributorConfig::Snapshot { .. } => DistributorKind::Snapshot,
        }
    }

    /// Canonical bytes used as `init_args`
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from `init_args`
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| crate::Error::InvalidConfig(format!("Malformed init args: {}", e)))
    }
}

/// Provisioned distributor instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Derived identity
    pub instance_id: InstanceId,

    /// Factory that provisioned the instance
    pub factory: InstanceId,

    /// Creator who requested provisioning
    pub creator: ParticipantId,

    /// Creator-chosen salt
    pub salt: Salt,

    /// Code identity installed at provisioning time
    pub code_identity: Hash,

    /// Opaque constructor configuration
    pub init_args: Vec<u8>,

    /// Claim variant
    pub kind: DistributorKind,

    /// Current logic pointer (starts at `code_identity`)
    pub logic: Hash,

    /// One-shot initialization flag
    pub initialized: bool,

    /// Provisioning timestamp
    pub created_at: DateTime<Utc>,

    /// Initialization timestamp
    pub initialized_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Fail unless the installed variant matches
    pub fn require_kind(&self, expected: DistributorKind) -> crate::Result<()> {
        if self.kind != expected {
            return Err(crate::Error::KindMismatch {
                instance: self.instance_id,
                expected: expected.name(),
                actual: self.kind.name(),
            });
        }
        Ok(())
    }

    /// Fail unless initialized
    pub fn require_initialized(&self) -> crate::Result<()> {
        if !self.initialized {
            return Err(crate::Error::NotInitialized(self.instance_id.to_string()));
        }
        Ok(())
    }
}

/// Merkle allow-list commitment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleCommitment {
    /// Committed root
    pub root: Hash,

    /// Ledger the instance custodies
    pub pool_ledger: LedgerId,

    /// Declared total allocation
    pub total_allocation: Entitlement,

    /// Number of leaves claimed so far
    pub claimed_count: u64,

    /// Sum of entitlements released so far
    pub total_claimed: Entitlement,
}

/// Snapshot distributor header (records are stored separately, by `snap_id`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDistributorState {
    /// Ledger whose historical balances weight each claim
    pub reference_ledger: LedgerId,

    /// Highest `snap_id` issued (0 before the first snapshot)
    pub latest_snap_id: SnapId,
}

/// Per-instance distributor state; an instance owns exactly one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributorState {
    /// Merkle commitment
    Merkle(MerkleCommitment),
    /// Snapshot sequence header
    Snapshot(SnapshotDistributorState),
}

/// One pro-rata distribution over one reference-ledger snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Distributor-local sequence number
    pub snap_id: SnapId,

    /// Snapshot taken on the reference ledger
    pub parent_snapshot_ref: LedgerSnapshotId,

    /// Ledger the allocation is paid from
    pub pool_ledger: LedgerId,

    /// Amount distributed across all holders
    pub total_allocation: Entitlement,

    /// Number of holders who have claimed
    pub claimed_count: u64,

    /// Sum of amounts released so far
    pub total_claimed: Entitlement,

    /// Record creation timestamp
    pub opened_at: DateTime<Utc>,
}

/// Observable event produced by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorEvent {
    /// Unique event ID (UUIDv7 for time-ordering)
    pub event_id: Uuid,

    /// Position in the event log (assigned at commit)
    pub sequence: u64,

    /// Instance (or factory) the event concerns
    pub instance_id: InstanceId,

    /// Event payload
    pub kind: EventKind,

    /// Commit timestamp
    pub recorded_at: DateTime<Utc>,
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Factory initialized
    FactoryInitialized {
        /// Chain context mixed into identities
        chain_context: u64,
    },
    /// Instance provisioned
    InstanceCreated {
        /// Creator
        creator: ParticipantId,
        /// Installed code identity
        code_identity: Hash,
    },
    /// Instance initialized
    Initialized {
        /// Variant
        kind: DistributorKind,
    },
    /// Merkle leaf claimed
    MerkleClaimed {
        /// Claimed leaf
        leaf: Hash,
        /// Beneficiary
        participant: ParticipantId,
        /// Amount released
        amount: Entitlement,
    },
    /// Snapshot record appended
    SnapshotOpened {
        /// Distributor-local id
        snap_id: SnapId,
        /// Reference-ledger snapshot
        parent_snapshot_ref: LedgerSnapshotId,
        /// Pool ledger
        pool_ledger: LedgerId,
        /// Allocation
        total_allocation: Entitlement,
    },
    /// Pro-rata claim released
    SnapshotClaimed {
        /// Distributor-local id
        snap_id: SnapId,
        /// Beneficiary
        participant: ParticipantId,
        /// Amount released
        amount: Entitlement,
    },
    /// Merkle claim rolled back after its transfer failed
    MerkleClaimReverted {
        /// Released leaf
        leaf: Hash,
        /// Beneficiary
        participant: ParticipantId,
        /// Amount not transferred
        amount: Entitlement,
    },
    /// Pro-rata claim rolled back after its transfer failed
    SnapshotClaimReverted {
        /// Distributor-local id
        snap_id: SnapId,
        /// Beneficiary
        participant: ParticipantId,
        /// Amount not transferred
        amount: Entitlement,
    },
    /// Logic pointer replaced
    Upgraded {
        /// New logic
        new_logic: Hash,
        /// Authorized caller
        caller: ParticipantId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_hex_roundtrip() {
        let id = ParticipantId::from_bytes([0x11; 32]);
        let text = id.to_string();
        assert!(text.starts_with("0x1111"));
        assert_eq!(ParticipantId::from_hex(&text), Some(id));
        assert_eq!(ParticipantId::from_hex("0x1234"), None);
    }

    #[test]
    fn test_kind_from_code_identity() {
        for kind in [DistributorKind::Merkle, DistributorKind::Snapshot] {
            assert_eq!(DistributorKind::from_code_identity(&kind.code_identity()), Some(kind));
        }
        assert_eq!(DistributorKind::from_code_identity(&[0u8; 32]), None);
    }

    #[test]
    fn test_config_decode_rejects_garbage() {
        let err = DistributorConfig::decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidConfig(_)));
    }

    #[test]
    fn test_instance_custody_account() {
        let instance = InstanceId::from_bytes([9u8; 32]);
        assert_eq!(instance.as_participant().as_bytes(), instance.as_bytes());
    }
}
