//! Capability introspection
//!
//! Tooling discovers what an instance implements by asking
//! `supports(tag)` instead of relying on type identity. A tag is the first
//! four bytes of the SHA-256 of the capability's interface name.

use crate::crypto::hash_bytes;
use crate::types::DistributorKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 4-byte capability tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityTag(pub [u8; 4]);

impl fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Known capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `supports(tag)` itself
    Introspection,
    /// Deterministic provisioning (`provision`, `predict_instance_id`)
    Factory,
    /// One-shot `initialize`
    Initializable,
    /// Authorization-checked `upgrade_to`
    Upgradeable,
    /// `claim(participant, entitlement, proof)`
    MerkleClaim,
    /// `open_snapshot`, `calculate_claim_amount`, `claim_snap`
    SnapshotClaim,
}

impl Capability {
    /// Interface name the tag is derived from
    pub fn interface_name(&self) -> &'static str {
        match self {
            Capability::Introspection => "ISupportsCapability",
            Capability::Factory => "IDeterministicFactory",
            Capability::Initializable => "IInitializable",
            Capability::Upgradeable => "IUpgradeable",
            Capability::MerkleClaim => "IMerkleClaim",
            Capability::SnapshotClaim => "ISnapshotClaim",
        }
    }

    /// Tag for this capability
    pub fn tag(&self) -> CapabilityTag {
        let digest = hash_bytes(self.interface_name().as_bytes());
        CapabilityTag([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Capabilities of the factory
    pub fn factory_set() -> &'static [Capability] {
        &[
            Capability::Introspection,
            Capability::Factory,
            Capability::Initializable,
        ]
    }

    /// Capabilities of a distributor variant
    pub fn distributor_set(kind: DistributorKind) -> &'static [Capability] {
        match kind {
            DistributorKind::Merkle => &[
                Capability::Introspection,
                Capability::Initializable,
                Capability::Upgradeable,
                Capability::MerkleClaim,
            ],
            DistributorKind::Snapshot => &[
                Capability::Introspection,
                Capability::Initializable,
                Capability::Upgradeable,
                Capability::SnapshotClaim,
            ],
        }
    }
}

/// Does `set` answer to `tag`?
pub fn supports(set: &[Capability], tag: CapabilityTag) -> bool {
    set.iter().any(|capability| capability.tag() == tag)
}
