//! Merkle allow-list distributor
//!
//! An instance commits to a root over `(participant, entitlement)` leaves and
//! releases each leaf's entitlement exactly once from the pool it custodies.
//! Anyone may submit a claim; the transfer always goes to the participant
//! named in the leaf.

use crate::crypto::leaf_hash;
use crate::instance::{
    load_instance, require_committed_config, require_uninitialized, stage_initialization,
};
use crate::ledger::Ledgers;
use crate::merkle::verify_proof;
use crate::storage::Storage;
use crate::types::{
    DistributorConfig, DistributorKind, DistributorState, Entitlement, EventKind, Hash, InstanceId, InstanceRecord,
    LedgerId, MerkleCommitment, ParticipantId,
};
use crate::{Error, Result};
use std::sync::Arc;

/// Released claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleClaimReceipt {
    /// Claimed leaf
    pub leaf: Hash,
    /// Beneficiary
    pub participant: ParticipantId,
    /// Amount transferred
    pub amount: Entitlement,
    /// Event log position of the claim
    pub sequence: u64,
}

/// Merkle variant operations
#[derive(Debug, Clone)]
pub struct MerkleDistributor {
    storage: Arc<Storage>,
    ledgers: Ledgers,
}

impl MerkleDistributor {
    /// Create over storage and the ledger directory
    pub fn new(storage: Arc<Storage>, ledgers: Ledgers) -> Self {
        Self { storage, ledgers }
    }

    /// Validate an initialization against `record` and build the commitment
    ///
    /// The pool must already custody `total_allocation` at the instance's
    /// identity, and the arguments must match the instance's `init_args`.
    pub async fn prepare_initialize(
        &self,
        record: &InstanceRecord,
        root: Hash,
        pool_ledger: LedgerId,
        total_allocation: Entitlement,
    ) -> Result<MerkleCommitment> {
        record.require_kind(DistributorKind::Merkle)?;
        require_uninitialized(record)?;
        require_committed_config(
            record,
            &DistributorConfig::Merkle {
                root,
                pool_ledger: pool_ledger.clone(),
                total_allocation,
            },
        )?;

        self.ledgers
            .require_custody(
                &pool_ledger,
                &record.instance_id.as_participant(),
                0,
                total_allocation,
            )
            .await?;

        Ok(MerkleCommitment {
            root,
            pool_ledger,
            total_allocation,
            claimed_count: 0,
            total_claimed: 0,
        })
    }

    /// Initialize a provisioned instance
    pub async fn initialize(
        &self,
        instance_id: &InstanceId,
        root: Hash,
        pool_ledger: LedgerId,
        total_allocation: Entitlement,
    ) -> Result<MerkleCommitment> {
        let mut record = load_instance(&self.storage, instance_id)?;
        let commitment = self
            .prepare_initialize(&record, root, pool_ledger, total_allocation)
            .await?;

        let mut batch = self.storage.batch();
        stage_initialization(
            &mut batch,
            &mut record,
            &DistributorState::Merkle(commitment.clone()),
        )?;
        batch.commit()?;

        tracing::info!(
            instance_id = %instance_id,
            root = %hex::encode(commitment.root),
            pool_ledger = %commitment.pool_ledger,
            total_allocation = commitment.total_allocation,
            "Merkle distributor initialized"
        );
        Ok(commitment)
    }

    /// Current commitment and counters
    pub fn commitment(&self, instance_id: &InstanceId) -> Result<MerkleCommitment> {
        let record = load_instance(&self.storage, instance_id)?;
        record.require_kind(DistributorKind::Merkle)?;
        record.require_initialized()?;

        match self.storage.get_state(instance_id)? {
            Some(DistributorState::Merkle(commitment)) => Ok(commitment),
            Some(DistributorState::Snapshot(_)) => Err(Error::KindMismatch {
                instance: *instance_id,
                expected: DistributorKind::Merkle.name(),
                actual: DistributorKind::Snapshot.name(),
            }),
            None => Err(Error::Storage(format!(
                "Missing state for initialized instance {}",
                instance_id
            ))),
        }
    }

    /// Has the leaf for `(participant, entitlement)` been claimed?
    pub fn is_claimed(
        &self,
        instance_id: &InstanceId,
        participant: &ParticipantId,
        entitlement: Entitlement,
    ) -> Result<bool> {
        self.commitment(instance_id)?;
        self.storage
            .is_leaf_claimed(instance_id, &leaf_hash(participant, entitlement))
    }

    /// Release `entitlement` to `participant` against a membership proof
    ///
    /// Callers must serialize claims per instance; the actor does.
    pub async fn claim(
        &self,
        instance_id: &InstanceId,
        participant: &ParticipantId,
        entitlement: Entitlement,
        proof: &[Hash],
    ) -> Result<MerkleClaimReceipt> {
        let mut commitment = self.commitment(instance_id)?;
        let leaf = leaf_hash(participant, entitlement);

        if !verify_proof(&commitment.root, leaf, proof) {
            return Err(Error::InvalidProof(leaf));
        }
        if self.storage.is_leaf_claimed(instance_id, &leaf)? {
            return Err(Error::AlreadyClaimed(leaf));
        }

        let previous = commitment.clone();
        commitment.claimed_count += 1;
        commitment.total_claimed = commitment
            .total_claimed
            .checked_add(entitlement)
            .filter(|claimed| *claimed <= commitment.total_allocation)
            .ok_or_else(|| {
                Error::Overflow(format!("Claims on {} exceed allocation", instance_id))
            })?;

        let custodian = instance_id.as_participant();
        let pool = self.ledgers.fungible(&commitment.pool_ledger)?;

        // The marker is durable before funds move
        let mut batch = self.storage.batch();
        batch.mark_leaf_claimed(instance_id, &leaf, entitlement)?;
        batch.put_state(instance_id, &DistributorState::Merkle(commitment))?;
        batch.push_event(
            *instance_id,
            EventKind::MerkleClaimed {
                leaf,
                participant: *participant,
                amount: entitlement,
            },
        );
        let events = batch.commit()?;

        if let Err(e) = pool.transfer(&custodian, participant, entitlement).await {
            tracing::warn!(
                instance_id = %instance_id,
                participant = %participant,
                error = %e,
                "Claim transfer failed, reverting claim"
            );
            let mut revert = self.storage.batch();
            revert.clear_leaf_claimed(instance_id, &leaf)?;
            revert.put_state(instance_id, &DistributorState::Merkle(previous))?;
            revert.push_event(
                *instance_id,
                EventKind::MerkleClaimReverted {
                    leaf,
                    participant: *participant,
                    amount: entitlement,
                },
            );
            revert.commit()?;
            return Err(e);
        }

        tracing::debug!(
            instance_id = %instance_id,
            participant = %participant,
            amount = entitlement,
            "Merkle claim released"
        );

        Ok(MerkleClaimReceipt {
            leaf,
            participant: *participant,
            amount: entitlement,
            sequence: events.first().map(|event| event.sequence).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{FungibleLedger, MemoryLedger};
    use crate::merkle::MerkleTree;
    use crate::Config;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        distributor: MerkleDistributor,
        ledger: Arc<MemoryLedger>,
        instance_id: InstanceId,
        tree: MerkleTree,
        _temp: TempDir,
    }

    fn participant(byte: u8) -> ParticipantId {
        ParticipantId::from_bytes([byte; 32])
    }

    fn pool() -> LedgerId {
        LedgerId::new("DCNT")
    }

    async fn fixture(funded: Entitlement) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());

        let ledger = Arc::new(MemoryLedger::new());
        let ledgers = Ledgers::new().with_snapshot(pool(), ledger.clone());

        let kind = DistributorKind::Merkle;
        let instance_id = InstanceId::from_bytes([0xaa; 32]);
        let record = InstanceRecord {
            instance_id,
            factory: InstanceId::from_bytes([0u8; 32]),
            creator: participant(1),
            salt: [0u8; 32],
            code_identity: kind.code_identity(),
            init_args: vec![],
            kind,
            logic: kind.code_identity(),
            initialized: false,
            created_at: Utc::now(),
            initialized_at: None,
        };
        let mut batch = storage.batch();
        batch.put_instance(&record).unwrap();
        batch.commit().unwrap();

        ledger.mint(&instance_id.as_participant(), funded).unwrap();

        let tree = MerkleTree::from_allocations(&[(participant(1), 100), (participant(2), 150)]);
        Fixture {
            distributor: MerkleDistributor::new(storage, ledgers),
            ledger,
            instance_id,
            tree,
            _temp: temp_dir,
        }
    }

    #[tokio::test]
    async fn test_initialize_requires_custody() {
        let f = fixture(249).await;
        let err = f
            .distributor
            .initialize(&f.instance_id, f.tree.root(), pool(), 250)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCustody { required: 250, available: 249, .. }
        ));
    }

    #[tokio::test]
    async fn test_initialize_once() {
        let f = fixture(250).await;
        f.distributor
            .initialize(&f.instance_id, f.tree.root(), pool(), 250)
            .await
            .unwrap();
        let err = f
            .distributor
            .initialize(&f.instance_id, f.tree.root(), pool(), 250)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized(_)));
    }

    #[tokio::test]
    async fn test_claim_before_initialize() {
        let f = fixture(250).await;
        let proof = f.tree.proof(0).unwrap();
        let err = f
            .distributor
            .claim(&f.instance_id, &participant(1), 100, &proof.siblings)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_claim_once() {
        let f = fixture(250).await;
        f.distributor
            .initialize(&f.instance_id, f.tree.root(), pool(), 250)
            .await
            .unwrap();
        let proof = f.tree.proof_for(&participant(1)).unwrap();

        let receipt = f
            .distributor
            .claim(&f.instance_id, &participant(1), 100, &proof.siblings)
            .await
            .unwrap();
        assert_eq!(receipt.amount, 100);
        assert_eq!(f.ledger.balance_of(&participant(1)).await.unwrap(), 100);
        assert_eq!(
            f.ledger.balance_of(&f.instance_id.as_participant()).await.unwrap(),
            150
        );

        let err = f
            .distributor
            .claim(&f.instance_id, &participant(1), 100, &proof.siblings)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyClaimed(leaf) if leaf == receipt.leaf));
        assert_eq!(f.ledger.balance_of(&participant(1)).await.unwrap(), 100);

        let commitment = f.distributor.commitment(&f.instance_id).unwrap();
        assert_eq!(commitment.claimed_count, 1);
        assert_eq!(commitment.total_claimed, 100);
        assert!(f.distributor.is_claimed(&f.instance_id, &participant(1), 100).unwrap());
        assert!(!f.distributor.is_claimed(&f.instance_id, &participant(2), 150).unwrap());
    }

    #[tokio::test]
    async fn test_inflated_amount_rejected() {
        let f = fixture(250).await;
        f.distributor
            .initialize(&f.instance_id, f.tree.root(), pool(), 250)
            .await
            .unwrap();
        let proof = f.tree.proof_for(&participant(2)).unwrap();

        let err = f
            .distributor
            .claim(&f.instance_id, &participant(2), 200, &proof.siblings)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidProof(_)));
        assert_eq!(f.ledger.balance_of(&participant(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_fails_when_pool_drained() {
        let f = fixture(250).await;
        f.distributor
            .initialize(&f.instance_id, f.tree.root(), pool(), 250)
            .await
            .unwrap();

        // Funds leave custody outside the distributor
        f.ledger
            .transfer(&f.instance_id.as_participant(), &participant(9), 200)
            .await
            .unwrap();

        let proof = f.tree.proof_for(&participant(2)).unwrap();
        let err = f
            .distributor
            .claim(&f.instance_id, &participant(2), 150, &proof.siblings)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ledger(_)));
        assert!(!f.distributor.is_claimed(&f.instance_id, &participant(2), 150).unwrap());

        let commitment = f.distributor.commitment(&f.instance_id).unwrap();
        assert_eq!(commitment.claimed_count, 0);
        assert_eq!(commitment.total_claimed, 0);

        let events = f.distributor.storage.events(0, 10).unwrap();
        assert!(matches!(
            events.last().unwrap().kind,
            EventKind::MerkleClaimReverted { amount: 150, .. }
        ));

        // Refunded custody lets the same leaf claim again
        f.ledger.mint(&f.instance_id.as_participant(), 100).unwrap();
        f.distributor
            .claim(&f.instance_id, &participant(2), 150, &proof.siblings)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_claims_capped_at_declared_allocation() {
        let f = fixture(1000).await;
        let tree = MerkleTree::from_allocations(&[(participant(1), 600), (participant(2), 400)]);
        f.distributor
            .initialize(&f.instance_id, tree.root(), pool(), 700)
            .await
            .unwrap();

        let first = tree.proof_for(&participant(1)).unwrap();
        f.distributor
            .claim(&f.instance_id, &participant(1), 600, &first.siblings)
            .await
            .unwrap();

        let second = tree.proof_for(&participant(2)).unwrap();
        let err = f
            .distributor
            .claim(&f.instance_id, &participant(2), 400, &second.siblings)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overflow(_)));
        assert_eq!(f.ledger.balance_of(&participant(2)).await.unwrap(), 0);
        assert_eq!(
            f.ledger.balance_of(&f.instance_id.as_participant()).await.unwrap(),
            400
        );

        let commitment = f.distributor.commitment(&f.instance_id).unwrap();
        assert_eq!(commitment.total_claimed, 600);
        assert!(!f.distributor.is_claimed(&f.instance_id, &participant(2), 400).unwrap());
    }

    #[tokio::test]
    async fn test_is_claimed_requires_merkle_instance() {
        let f = fixture(250).await;
        let unknown = InstanceId::from_bytes([0xcd; 32]);
        let err = f
            .distributor
            .is_claimed(&unknown, &participant(1), 100)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownInstance(id) if id == unknown));

        let err = f
            .distributor
            .is_claimed(&f.instance_id, &participant(1), 100)
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
    }
}
