//! Fungible ledger collaborators
//!
//! Distributors never own a ledger; they are handed one through the
//! [`FungibleLedger`] / [`SnapshotLedger`] traits and address it by
//! [`LedgerId`] via the [`Ledgers`] directory.
//!
//! [`MemoryLedger`] is a complete snapshot-capable implementation kept in
//! process memory. Historical balances use lazy checkpoints: the value an
//! account held when a snapshot was taken is only recorded the first time
//! the account changes afterwards.

use crate::types::{Entitlement, LedgerId, LedgerSnapshotId, ParticipantId};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Balance, supply and custodial transfer
#[async_trait]
pub trait FungibleLedger: Send + Sync {
    /// Current balance
    async fn balance_of(&self, holder: &ParticipantId) -> Result<Entitlement>;

    /// Current total supply
    async fn total_supply(&self) -> Result<Entitlement>;

    /// Move `amount` out of `from` (an account the caller custodies) to `to`
    async fn transfer(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        amount: Entitlement,
    ) -> Result<()>;
}

/// Point-in-time balance queries
#[async_trait]
pub trait SnapshotLedger: FungibleLedger {
    /// Freeze current balances; ids are monotonic
    async fn snapshot(&self) -> Result<LedgerSnapshotId>;

    /// Balance held when `snapshot_id` was taken
    async fn balance_of_at(
        &self,
        holder: &ParticipantId,
        snapshot_id: LedgerSnapshotId,
    ) -> Result<Entitlement>;

    /// Total supply when `snapshot_id` was taken
    async fn total_supply_at(&self, snapshot_id: LedgerSnapshotId) -> Result<Entitlement>;
}

/// Directory of ledgers reachable by the engine
#[derive(Clone, Default)]
pub struct Ledgers {
    fungible: HashMap<LedgerId, Arc<dyn FungibleLedger>>,
    snapshot: HashMap<LedgerId, Arc<dyn SnapshotLedger>>,
}

impl std::fmt::Debug for Ledgers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledgers")
            .field("fungible", &self.fungible.keys().collect::<Vec<_>>())
            .field("snapshot", &self.snapshot.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Ledgers {
    /// Create empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ledger usable as a pool
    pub fn register<L: FungibleLedger + 'static>(&mut self, id: LedgerId, ledger: Arc<L>) {
        self.fungible.insert(id, ledger);
    }

    /// Register a snapshot-capable ledger, usable as pool and as reference
    pub fn register_snapshot<L: SnapshotLedger + 'static>(&mut self, id: LedgerId, ledger: Arc<L>) {
        self.fungible.insert(id.clone(), ledger.clone());
        self.snapshot.insert(id, ledger);
    }

    /// Builder form of [`Ledgers::register_snapshot`]
    pub fn with_snapshot<L: SnapshotLedger + 'static>(mut self, id: LedgerId, ledger: Arc<L>) -> Self {
        self.register_snapshot(id, ledger);
        self
    }

    /// Resolve a pool ledger
    pub fn fungible(&self, id: &LedgerId) -> Result<Arc<dyn FungibleLedger>> {
        self.fungible
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownLedger(id.clone()))
    }

    /// Resolve a reference ledger
    pub fn snapshot(&self, id: &LedgerId) -> Result<Arc<dyn SnapshotLedger>> {
        self.snapshot
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownLedger(id.clone()))
    }

    /// Resolve a pool ledger and check that `custodian` holds at least
    /// `reserved + required` on it
    pub async fn require_custody(
        &self,
        id: &LedgerId,
        custodian: &ParticipantId,
        reserved: Entitlement,
        required: Entitlement,
    ) -> Result<Arc<dyn FungibleLedger>> {
        let ledger = self.fungible(id)?;
        let balance = ledger.balance_of(custodian).await?;
        let available = balance.saturating_sub(reserved);

        if available < required {
            return Err(Error::InsufficientCustody {
                ledger: id.clone(),
                required,
                available,
            });
        }
        Ok(ledger)
    }
}

/// Initial distribution of a new ledger
#[derive(Debug, Clone)]
pub struct Genesis {
    /// Initial holders
    pub holders: Vec<ParticipantId>,
    /// Allocation per holder (same order as `holders`)
    pub allocations: Vec<Entitlement>,
    /// Total supply minted at genesis
    pub total_supply: Entitlement,
    /// Receives `total_supply - Σ allocations`
    pub treasury: ParticipantId,
}

/// Values recorded per snapshot id, in increasing id order
#[derive(Debug, Default, Clone)]
struct Checkpoints {
    ids: Vec<LedgerSnapshotId>,
    values: Vec<Entitlement>,
}

impl Checkpoints {
    /// Record `current` for the active snapshot unless already recorded
    fn update(&mut self, current_snapshot: LedgerSnapshotId, current: Entitlement) {
        if current_snapshot == 0 {
            return;
        }
        if self.ids.last().map_or(true, |last| *last < current_snapshot) {
            self.ids.push(current_snapshot);
            self.values.push(current);
        }
    }

    /// Value at `snapshot_id`, or `None` if unchanged since
    fn value_at(&self, snapshot_id: LedgerSnapshotId) -> Option<Entitlement> {
        let index = self.ids.partition_point(|id| *id < snapshot_id);
        self.values.get(index).copied()
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<ParticipantId, Entitlement>,
    total_supply: Entitlement,
    current_snapshot: LedgerSnapshotId,
    balance_checkpoints: HashMap<ParticipantId, Checkpoints>,
    supply_checkpoints: Checkpoints,
}

impl LedgerState {
    fn balance(&self, holder: &ParticipantId) -> Entitlement {
        self.balances.get(holder).copied().unwrap_or(0)
    }

    fn checkpoint_account(&mut self, holder: &ParticipantId) {
        let current = self.balance(holder);
        let snapshot = self.current_snapshot;
        self.balance_checkpoints
            .entry(*holder)
            .or_default()
            .update(snapshot, current);
    }

    fn require_snapshot(&self, snapshot_id: LedgerSnapshotId) -> Result<()> {
        if snapshot_id == 0 || snapshot_id > self.current_snapshot {
            return Err(Error::Ledger(format!("Nonexistent snapshot {}", snapshot_id)));
        }
        Ok(())
    }
}

/// In-memory snapshot-capable ledger
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    /// Create empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Create ledger with a genesis distribution
    pub fn with_genesis(genesis: Genesis) -> Result<Self> {
        if genesis.holders.len() != genesis.allocations.len() {
            return Err(Error::InvalidConfig(format!(
                "{} holders but {} allocations",
                genesis.holders.len(),
                genesis.allocations.len()
            )));
        }

        let allocated = genesis
            .allocations
            .iter()
            .try_fold(0u128, |acc, amount| acc.checked_add(*amount))
            .ok_or_else(|| Error::Overflow("Genesis allocations".to_string()))?;

        if allocated > genesis.total_supply {
            return Err(Error::InvalidConfig(format!(
                "Allocations {} exceed total supply {}",
                allocated, genesis.total_supply
            )));
        }

        let ledger = Self::new();
        for (holder, amount) in genesis.holders.iter().zip(&genesis.allocations) {
            ledger.mint(holder, *amount)?;
        }
        ledger.mint(&genesis.treasury, genesis.total_supply - allocated)?;

        Ok(ledger)
    }

    /// Create new units for `to`
    pub fn mint(&self, to: &ParticipantId, amount: Entitlement) -> Result<()> {
        let mut state = self.state.write();

        let supply = state
            .total_supply
            .checked_add(amount)
            .ok_or_else(|| Error::Overflow("Total supply".to_string()))?;

        let snapshot = state.current_snapshot;
        let current_supply = state.total_supply;
        state.supply_checkpoints.update(snapshot, current_supply);
        state.checkpoint_account(to);

        let balance = state.balance(to) + amount;
        state.balances.insert(*to, balance);
        state.total_supply = supply;
        Ok(())
    }

    /// Id of the latest snapshot (0 if none)
    pub fn current_snapshot_id(&self) -> LedgerSnapshotId {
        self.state.read().current_snapshot
    }
}

#[async_trait]
impl FungibleLedger for MemoryLedger {
    async fn balance_of(&self, holder: &ParticipantId) -> Result<Entitlement> {
        Ok(self.state.read().balance(holder))
    }

    async fn total_supply(&self) -> Result<Entitlement> {
        Ok(self.state.read().total_supply)
    }

    async fn transfer(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        amount: Entitlement,
    ) -> Result<()> {
        let mut state = self.state.write();

        let from_balance = state.balance(from);
        if from_balance < amount {
            return Err(Error::Ledger(format!(
                "Insufficient balance: {} holds {}, needs {}",
                from, from_balance, amount
            )));
        }
        if from == to {
            return Ok(());
        }

        state.checkpoint_account(from);
        state.checkpoint_account(to);

        state.balances.insert(*from, from_balance - amount);
        let to_balance = state.balance(to) + amount;
        state.balances.insert(*to, to_balance);
        Ok(())
    }
}

#[async_trait]
impl SnapshotLedger for MemoryLedger {
    async fn snapshot(&self) -> Result<LedgerSnapshotId> {
        let mut state = self.state.write();
        state.current_snapshot += 1;
        Ok(state.current_snapshot)
    }

    async fn balance_of_at(
        &self,
        holder: &ParticipantId,
        snapshot_id: LedgerSnapshotId,
    ) -> Result<Entitlement> {
        let state = self.state.read();
        state.require_snapshot(snapshot_id)?;

        let recorded = state
            .balance_checkpoints
            .get(holder)
            .and_then(|checkpoints| checkpoints.value_at(snapshot_id));
        Ok(recorded.unwrap_or_else(|| state.balance(holder)))
    }

    async fn total_supply_at(&self, snapshot_id: LedgerSnapshotId) -> Result<Entitlement> {
        let state = self.state.read();
        state.require_snapshot(snapshot_id)?;
        Ok(state
            .supply_checkpoints
            .value_at(snapshot_id)
            .unwrap_or(state.total_supply))
    }
}
