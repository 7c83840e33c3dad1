//! Hashing primitives for the claim core
//!
//! This module provides:
//! - SHA-256 hashing of byte strings
//! - Leaf and interior-node hashing for allow-list commitments
//! - Content-addressed identity derivation for the deterministic factory
//!
//! Every function here is pure: same inputs, same 32 bytes, on any host.

use crate::types::{Entitlement, Hash, InstanceId, ParticipantId, Salt};
use sha2::{Digest, Sha256};

/// Domain tag for allow-list leaves
const LEAF_TAG: u8 = 0x00;

/// Domain tag for allow-list interior nodes
const NODE_TAG: u8 = 0x01;

/// Domain tag for instance identities
const INSTANCE_TAG: u8 = 0xff;

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash the concatenation of several byte strings
pub fn hashv(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Code identity for a named logic version
pub fn code_identity(name: &str) -> Hash {
    hashv(&[b"claim-core/code/", name.as_bytes()])
}

/// Allow-list leaf for `(participant, entitlement)`
///
/// Binds identity and amount together: changing either changes the leaf.
pub fn leaf_hash(participant: &ParticipantId, entitlement: Entitlement) -> Hash {
    hashv(&[
        &[LEAF_TAG],
        participant.as_bytes(),
        &entitlement.to_be_bytes(),
    ])
}

/// Hash two sibling nodes in canonical order
///
/// The lexicographically smaller operand is always hashed first, so a proof
/// is just the list of siblings with no left/right bookkeeping.
pub fn hash_pair(a: &Hash, b: &Hash) -> Hash {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    hashv(&[&[NODE_TAG], first, second])
}

/// Per-creator seed: `H(creator, creator, chain_context, salt)`
pub fn identity_seed(creator: &ParticipantId, chain_context: u64, salt: &Salt) -> Hash {
    hashv(&[
        creator.as_bytes(),
        creator.as_bytes(),
        &chain_context.to_be_bytes(),
        salt,
    ])
}

/// Content hash of the code and its constructor configuration
pub fn init_code_hash(code_identity: &Hash, init_args: &[u8]) -> Hash {
    hashv(&[code_identity, init_args])
}

/// Derive an instance identity from the factory, seed and init-code hash
pub fn derive_instance_id(factory: &InstanceId, seed: &Hash, init_code_hash: &Hash) -> InstanceId {
    InstanceId::from_bytes(hashv(&[
        &[INSTANCE_TAG],
        factory.as_bytes(),
        seed,
        init_code_hash,
    ]))
}

/// Identity of a factory, from its label and chain context
pub fn factory_identity(label: &str, chain_context: u64) -> InstanceId {
    InstanceId::from_bytes(hashv(&[
        b"claim-core/factory/",
        &chain_context.to_be_bytes(),
        label.as_bytes(),
    ]))
}
