//! Claim Core
//!
//! Deterministically provisioned claim distributors releasing pre-funded
//! pools to eligible participants.
//!
//! # Architecture
//!
//! - **Deterministic Factory**: Instance identities are content addresses of
//!   `(factory, creator, chain context, salt, code, init args)`
//! - **Merkle Distributor**: Allow-list claims proven against a committed root
//! - **Snapshot Distributor**: Pro-rata claims weighted by frozen balances of
//!   a reference ledger
//! - **Single Writer**: One actor serializes every state transition
//! - **RocksDB**: Claimed sets, records and the event log commit atomically
//!
//! # Invariants
//!
//! - Each Merkle leaf and each `(snapshot, participant)` pays out at most once
//! - Σ released ≤ declared allocation, per commitment and per snapshot
//! - Snapshot records are append-only and their entitlements never change
//! - A rejected operation leaves no state behind; a claim whose transfer
//!   fails is rolled back and logged with a revert event

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod access;
pub mod actor;
pub mod capability;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod factory;
pub mod instance;
pub mod ledger;
pub mod merkle;
pub mod merkle_distributor;
pub mod metrics;
pub mod snapshot_distributor;
pub mod storage;
pub mod types;

// Re-exports
pub use access::{AccessControl, RoleRegistry};
pub use capability::{Capability, CapabilityTag};
pub use config::Config;
pub use engine::ClaimEngine;
pub use error::{Error, Result};
pub use ledger::{FungibleLedger, Genesis, Ledgers, MemoryLedger, SnapshotLedger};
pub use merkle::{MerkleProof, MerkleTree};
pub use merkle_distributor::MerkleClaimReceipt;
pub use snapshot_distributor::SnapshotClaimReceipt;
pub use storage::Storage;
pub use types::{
    DistributorConfig, DistributorEvent, DistributorKind, Entitlement, EventKind, Hash,
    InstanceId, InstanceRecord, LedgerId, ParticipantId, Salt, SnapId, SnapshotRecord,
};
