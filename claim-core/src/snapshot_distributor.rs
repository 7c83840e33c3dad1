//! Snapshot pro-rata distributor
//!
//! Each call to `open_snapshot` freezes the reference ledger and appends a
//! record that splits `total_allocation` across holders in proportion to
//! their frozen balances:
//!
//! ```text
//! amount = floor(total_allocation * balance_at(holder) / supply_at)
//! ```
//!
//! Rounding remainders stay in custody. A record reserves its unclaimed
//! allocation on the pool, so later records cannot count the same funds.

use crate::instance::{
    load_instance, require_committed_config, require_uninitialized, stage_initialization,
};
use crate::ledger::Ledgers;
use crate::storage::Storage;
use crate::types::{
    DistributorConfig, DistributorKind, DistributorState, Entitlement, EventKind, InstanceId, InstanceRecord,
    LedgerId, ParticipantId, SnapId, SnapshotDistributorState, SnapshotRecord,
};
use crate::{Error, Result};
use chrono::Utc;
use primitive_types::U256;
use std::sync::Arc;

/// `floor(total_allocation * balance / supply)` without intermediate overflow
///
/// Zero supply yields zero.
pub fn pro_rata(
    total_allocation: Entitlement,
    balance: Entitlement,
    supply: Entitlement,
) -> Result<Entitlement> {
    if supply == 0 {
        return Ok(0);
    }

    let amount = U256::from(total_allocation) * U256::from(balance) / U256::from(supply);
    if amount > U256::from(u128::MAX) {
        return Err(Error::Overflow(format!(
            "Pro-rata share of {} for balance {} over supply {}",
            total_allocation, balance, supply
        )));
    }
    Ok(amount.low_u128())
}

/// Released pro-rata claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotClaimReceipt {
    /// Snapshot claimed against
    pub snap_id: SnapId,
    /// Beneficiary
    pub participant: ParticipantId,
    /// Amount transferred
    pub amount: Entitlement,
    /// Event log position of the claim
    pub sequence: u64,
}

/// Snapshot variant operations
#[derive(Debug, Clone)]
pub struct SnapshotDistributor {
    storage: Arc<Storage>,
    ledgers: Ledgers,
}

impl SnapshotDistributor {
    /// Create over storage and the ledger directory
    pub fn new(storage: Arc<Storage>, ledgers: Ledgers) -> Self {
        Self { storage, ledgers }
    }

    /// Validate an initialization against `record`
    pub fn prepare_initialize(
        &self,
        record: &InstanceRecord,
        reference_ledger: LedgerId,
    ) -> Result<SnapshotDistributorState> {
        record.require_kind(DistributorKind::Snapshot)?;
        require_uninitialized(record)?;
        require_committed_config(
            record,
            &DistributorConfig::Snapshot {
                reference_ledger: reference_ledger.clone(),
            },
        )?;
        self.ledgers.snapshot(&reference_ledger)?;

        Ok(SnapshotDistributorState {
            reference_ledger,
            latest_snap_id: 0,
        })
    }

    /// Initialize a provisioned instance
    pub fn initialize(
        &self,
        instance_id: &InstanceId,
        reference_ledger: LedgerId,
    ) -> Result<SnapshotDistributorState> {
        let mut record = load_instance(&self.storage, instance_id)?;
        let state = self.prepare_initialize(&record, reference_ledger)?;

        let mut batch = self.storage.batch();
        stage_initialization(
            &mut batch,
            &mut record,
            &DistributorState::Snapshot(state.clone()),
        )?;
        batch.commit()?;

        tracing::info!(
            instance_id = %instance_id,
            reference_ledger = %state.reference_ledger,
            "Snapshot distributor initialized"
        );
        Ok(state)
    }

    /// Distributor header
    pub fn state(&self, instance_id: &InstanceId) -> Result<SnapshotDistributorState> {
        let record = load_instance(&self.storage, instance_id)?;
        record.require_kind(DistributorKind::Snapshot)?;
        record.require_initialized()?;

        match self.storage.get_state(instance_id)? {
            Some(DistributorState::Snapshot(state)) => Ok(state),
            Some(DistributorState::Merkle(_)) => Err(Error::KindMismatch {
                instance: *instance_id,
                expected: DistributorKind::Snapshot.name(),
                actual: DistributorKind::Merkle.name(),
            }),
            None => Err(Error::Storage(format!(
                "Missing state for initialized instance {}",
                instance_id
            ))),
        }
    }

    /// Highest issued `snap_id` (0 before the first)
    pub fn latest_snap_id(&self, instance_id: &InstanceId) -> Result<SnapId> {
        Ok(self.state(instance_id)?.latest_snap_id)
    }

    /// Snapshot record by id
    pub fn snapshot(&self, instance_id: &InstanceId, snap_id: SnapId) -> Result<SnapshotRecord> {
        self.state(instance_id)?;
        self.load_snapshot(instance_id, snap_id)
    }

    fn load_snapshot(&self, instance_id: &InstanceId, snap_id: SnapId) -> Result<SnapshotRecord> {
        self.storage
            .get_snapshot(instance_id, snap_id)?
            .ok_or(Error::UnknownSnapshot {
                instance: *instance_id,
                snap_id,
            })
    }

    /// Has `participant` claimed under `snap_id`?
    pub fn is_claimed(
        &self,
        instance_id: &InstanceId,
        snap_id: SnapId,
        participant: &ParticipantId,
    ) -> Result<bool> {
        self.state(instance_id)?;
        self.storage.is_snap_claimed(instance_id, snap_id, participant)
    }

    /// Unclaimed allocation already promised out of `pool_ledger`
    fn reserved_on(
        &self,
        instance_id: &InstanceId,
        latest_snap_id: SnapId,
        pool_ledger: &LedgerId,
    ) -> Result<Entitlement> {
        let mut reserved: Entitlement = 0;
        for snap_id in 1..=latest_snap_id {
            let record = self.load_snapshot(instance_id, snap_id)?;
            if &record.pool_ledger != pool_ledger {
                continue;
            }
            reserved = reserved
                .checked_add(record.total_allocation.saturating_sub(record.total_claimed))
                .ok_or_else(|| Error::Overflow(format!("Reserved custody on {}", pool_ledger)))?;
        }
        Ok(reserved)
    }

    /// Freeze the reference ledger and append a new snapshot record
    pub async fn open_snapshot(
        &self,
        instance_id: &InstanceId,
        pool_ledger: LedgerId,
        total_allocation: Entitlement,
    ) -> Result<SnapshotRecord> {
        let mut state = self.state(instance_id)?;

        let reserved = self.reserved_on(instance_id, state.latest_snap_id, &pool_ledger)?;
        self.ledgers
            .require_custody(
                &pool_ledger,
                &instance_id.as_participant(),
                reserved,
                total_allocation,
            )
            .await?;

        let snap_id = state
            .latest_snap_id
            .checked_add(1)
            .ok_or_else(|| Error::Overflow(format!("Snapshot id on {}", instance_id)))?;

        let reference = self.ledgers.snapshot(&state.reference_ledger)?;
        let parent_snapshot_ref = reference.snapshot().await?;

        let record = SnapshotRecord {
            snap_id,
            parent_snapshot_ref,
            pool_ledger,
            total_allocation,
            claimed_count: 0,
            total_claimed: 0,
            opened_at: Utc::now(),
        };
        state.latest_snap_id = snap_id;

        let mut batch = self.storage.batch();
        batch.put_snapshot(instance_id, &record)?;
        batch.put_state(instance_id, &DistributorState::Snapshot(state))?;
        batch.push_event(
            *instance_id,
            EventKind::SnapshotOpened {
                snap_id,
                parent_snapshot_ref,
                pool_ledger: record.pool_ledger.clone(),
                total_allocation,
            },
        );
        batch.commit()?;

        tracing::info!(
            instance_id = %instance_id,
            snap_id,
            parent_snapshot_ref,
            total_allocation,
            "Snapshot opened"
        );
        Ok(record)
    }

    /// Entitlement `participant` could claim now (0 once claimed)
    pub async fn calculate_claim_amount(
        &self,
        instance_id: &InstanceId,
        snap_id: SnapId,
        participant: &ParticipantId,
    ) -> Result<Entitlement> {
        let state = self.state(instance_id)?;
        let record = self.load_snapshot(instance_id, snap_id)?;
        self.entitlement(&state, instance_id, &record, participant)
            .await
    }

    async fn entitlement(
        &self,
        state: &SnapshotDistributorState,
        instance_id: &InstanceId,
        record: &SnapshotRecord,
        participant: &ParticipantId,
    ) -> Result<Entitlement> {
        if self
            .storage
            .is_snap_claimed(instance_id, record.snap_id, participant)?
        {
            return Ok(0);
        }

        let reference = self.ledgers.snapshot(&state.reference_ledger)?;
        let balance = reference
            .balance_of_at(participant, record.parent_snapshot_ref)
            .await?;
        if balance == 0 {
            return Ok(0);
        }
        let supply = reference.total_supply_at(record.parent_snapshot_ref).await?;

        pro_rata(record.total_allocation, balance, supply)
    }

    /// Release `participant`'s pro-rata share of `snap_id`
    ///
    /// Callers must serialize claims per instance; the actor does.
    pub async fn claim_snap(
        &self,
        instance_id: &InstanceId,
        snap_id: SnapId,
        participant: &ParticipantId,
    ) -> Result<SnapshotClaimReceipt> {
        let state = self.state(instance_id)?;
        let mut record = self.load_snapshot(instance_id, snap_id)?;

        let amount = self
            .entitlement(&state, instance_id, &record, participant)
            .await?;
        if amount == 0 {
            return Err(Error::NoAllocation {
                snap_id,
                participant: *participant,
            });
        }

        let previous = record.clone();
        record.claimed_count += 1;
        record.total_claimed = record
            .total_claimed
            .checked_add(amount)
            .filter(|claimed| *claimed <= record.total_allocation)
            .ok_or_else(|| {
                Error::Overflow(format!(
                    "Claims on snapshot {} of {} exceed allocation",
                    snap_id, instance_id
                ))
            })?;

        let custodian = instance_id.as_participant();
        let pool = self.ledgers.fungible(&record.pool_ledger)?;

        // The marker is durable before funds move
        let mut batch = self.storage.batch();
        batch.mark_snap_claimed(instance_id, snap_id, participant, amount)?;
        batch.put_snapshot(instance_id, &record)?;
        batch.push_event(
            *instance_id,
            EventKind::SnapshotClaimed {
                snap_id,
                participant: *participant,
                amount,
            },
        );
        let events = batch.commit()?;

        if let Err(e) = pool.transfer(&custodian, participant, amount).await {
            tracing::warn!(
                instance_id = %instance_id,
                snap_id,
                participant = %participant,
                error = %e,
                "Claim transfer failed, reverting claim"
            );
            let mut revert = self.storage.batch();
            revert.clear_snap_claimed(instance_id, snap_id, participant)?;
            revert.put_snapshot(instance_id, &previous)?;
            revert.push_event(
                *instance_id,
                EventKind::SnapshotClaimReverted {
                    snap_id,
                    participant: *participant,
                    amount,
                },
            );
            revert.commit()?;
            return Err(e);
        }

        tracing::debug!(
            instance_id = %instance_id,
            snap_id,
            participant = %participant,
            amount,
            "Snapshot claim released"
        );

        Ok(SnapshotClaimReceipt {
            snap_id,
            participant: *participant,
            amount,
            sequence: events.first().map(|event| event.sequence).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{FungibleLedger, Genesis, MemoryLedger};
    use crate::Config;
    use tempfile::TempDir;

    struct Fixture {
        distributor: SnapshotDistributor,
        dcnt: Arc<MemoryLedger>,
        instance_id: InstanceId,
        _temp: TempDir,
    }

    fn participant(byte: u8) -> ParticipantId {
        ParticipantId::from_bytes([byte; 32])
    }

    fn dcnt() -> LedgerId {
        LedgerId::new("DCNT")
    }

    /// Holders 1 and 2 with 100 each; the instance custodies the 800 treasury
    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());

        let kind = DistributorKind::Snapshot;
        let instance_id = InstanceId::from_bytes([0xbb; 32]);
        let dcnt_ledger = Arc::new(
            MemoryLedger::with_genesis(Genesis {
                holders: vec![participant(1), participant(2)],
                allocations: vec![100, 100],
                total_supply: 1000,
                treasury: instance_id.as_participant(),
            })
            .unwrap(),
        );
        let ledgers = Ledgers::new().with_snapshot(dcnt(), dcnt_ledger.clone());

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

        let distributor = SnapshotDistributor::new(storage, ledgers);
        distributor.initialize(&instance_id, dcnt()).unwrap();

        Fixture {
            distributor,
            dcnt: dcnt_ledger,
            instance_id,
            _temp: temp_dir,
        }
    }

    #[test]
    fn test_pro_rata() {
        assert_eq!(pro_rata(800, 400, 1000).unwrap(), 320);
        assert_eq!(pro_rata(10, 1, 3).unwrap(), 3);
        assert_eq!(pro_rata(10, 0, 3).unwrap(), 0);
        assert_eq!(pro_rata(10, 5, 0).unwrap(), 0);
        assert_eq!(pro_rata(u128::MAX, u128::MAX, u128::MAX).unwrap(), u128::MAX);
        assert!(matches!(pro_rata(u128::MAX, 2, 1), Err(Error::Overflow(_))));
    }

    #[tokio::test]
    async fn test_pro_rata_claim_then_no_allocation() {
        let f = fixture();
        // Holder 2 ends with 400 of 1000
        f.dcnt.transfer(&participant(1), &participant(2), 100).await.unwrap();
        f.dcnt
            .transfer(&f.instance_id.as_participant(), &participant(2), 200)
            .await
            .unwrap();
        // Custody is now 600; allocate 600
        let record = f.distributor.open_snapshot(&f.instance_id, dcnt(), 600).await.unwrap();
        assert_eq!(record.snap_id, 1);

        // 600 * 400 / 1000
        let amount = f
            .distributor
            .calculate_claim_amount(&f.instance_id, 1, &participant(2))
            .await
            .unwrap();
        assert_eq!(amount, 240);

        let receipt = f.distributor.claim_snap(&f.instance_id, 1, &participant(2)).await.unwrap();
        assert_eq!(receipt.amount, 240);
        assert_eq!(f.dcnt.balance_of(&participant(2)).await.unwrap(), 640);

        let err = f
            .distributor
            .claim_snap(&f.instance_id, 1, &participant(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAllocation { snap_id: 1, .. }));
        assert_eq!(
            f.distributor
                .calculate_claim_amount(&f.instance_id, 1, &participant(2))
                .await
                .unwrap(),
            0
        );

        // Holder 1 held nothing at the snapshot
        let err = f
            .distributor
            .claim_snap(&f.instance_id, 1, &participant(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAllocation { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_isolated_from_later_transfers() {
        let f = fixture();
        f.distributor.open_snapshot(&f.instance_id, dcnt(), 400).await.unwrap();

        f.dcnt.transfer(&participant(1), &participant(3), 100).await.unwrap();

        // 400 * 100 / 1000
        assert_eq!(
            f.distributor
                .calculate_claim_amount(&f.instance_id, 1, &participant(1))
                .await
                .unwrap(),
            40
        );
        assert_eq!(
            f.distributor
                .calculate_claim_amount(&f.instance_id, 1, &participant(3))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_open_snapshot_respects_reserved_custody() {
        let f = fixture();
        f.distributor.open_snapshot(&f.instance_id, dcnt(), 500).await.unwrap();

        let err = f
            .distributor
            .open_snapshot(&f.instance_id, dcnt(), 301)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCustody { required: 301, available: 300, .. }
        ));
        assert_eq!(f.distributor.latest_snap_id(&f.instance_id).unwrap(), 1);

        let second = f.distributor.open_snapshot(&f.instance_id, dcnt(), 300).await.unwrap();
        assert_eq!(second.snap_id, 2);
        assert!(second.parent_snapshot_ref > 1);
    }

    #[tokio::test]
    async fn test_failed_transfer_reverts_claim() {
        let f = fixture();
        f.distributor.open_snapshot(&f.instance_id, dcnt(), 400).await.unwrap();

        // Custody drained outside the distributor
        f.dcnt
            .transfer(&f.instance_id.as_participant(), &participant(9), 800)
            .await
            .unwrap();

        let err = f
            .distributor
            .claim_snap(&f.instance_id, 1, &participant(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ledger(_)));
        assert!(!f.distributor.is_claimed(&f.instance_id, 1, &participant(1)).unwrap());

        let record = f.distributor.snapshot(&f.instance_id, 1).unwrap();
        assert_eq!(record.claimed_count, 0);
        assert_eq!(record.total_claimed, 0);

        let events = f.distributor.storage.events(0, 20).unwrap();
        assert!(matches!(
            events.last().unwrap().kind,
            EventKind::SnapshotClaimReverted { snap_id: 1, amount: 40, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_snapshot() {
        let f = fixture();
        let err = f
            .distributor
            .claim_snap(&f.instance_id, 7, &participant(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSnapshot { snap_id: 7, .. }));
    }

    #[tokio::test]
    async fn test_claims_never_exceed_allocation() {
        let f = fixture();
        let record = f.distributor.open_snapshot(&f.instance_id, dcnt(), 7).await.unwrap();

        let mut claimed = 0;
        for holder in [participant(1), participant(2), f.instance_id.as_participant()] {
            if let Ok(receipt) = f
                .distributor
                .claim_snap(&f.instance_id, record.snap_id, &holder)
                .await
            {
                claimed += receipt.amount;
            }
        }

        let stored = f.distributor.snapshot(&f.instance_id, record.snap_id).unwrap();
        assert_eq!(stored.total_claimed, claimed);
        assert!(claimed <= 7);
    }
}
