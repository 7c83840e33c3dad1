//! Engine facade
//!
//! Ties storage, the factory, both distributor variants and the actor into
//! one API. Mutations go through the actor; queries read storage directly.
//!
//! # Example
//!
//! ```no_run
//! use claim_core::{ClaimEngine, Config, Ledgers, RoleRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> claim_core::Result<()> {
//!     let engine = ClaimEngine::open(
//!         Config::default(),
//!         Ledgers::new(),
//!         Arc::new(RoleRegistry::new()),
//!     )
//!     .await?;
//!
//!     engine.initialize_factory().await?;
//!     // let record = engine.create(creator, salt, config).await?;
//!
//!     engine.shutdown().await
//! }
//! ```

use crate::access::AccessControl;
use crate::actor::{spawn_distributor_actor, Components, DistributorHandle};
use crate::capability::CapabilityTag;
use crate::factory::{DeterministicFactory, FactoryRecord};
use crate::instance::Instances;
use crate::ledger::Ledgers;
use crate::merkle_distributor::{MerkleClaimReceipt, MerkleDistributor};
use crate::metrics::Metrics;
use crate::snapshot_distributor::{SnapshotClaimReceipt, SnapshotDistributor};
use crate::storage::{Storage, StorageStats};
use crate::types::{
    DistributorConfig, DistributorEvent, Entitlement, Hash, InstanceId, InstanceRecord, LedgerId,
    MerkleCommitment, ParticipantId, Salt, SnapId, SnapshotDistributorState, SnapshotRecord,
};
use crate::{Config, Error, Result};
use std::sync::Arc;

/// Claim engine
#[derive(Debug)]
pub struct ClaimEngine {
    /// Actor handle for mutations
    handle: DistributorHandle,

    /// Direct access for reads
    components: Components,

    /// Metrics shared with the actor
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl ClaimEngine {
    /// Open the engine over `ledgers`, authorizing privileged calls with `access`
    pub async fn open(
        config: Config,
        ledgers: Ledgers,
        access: Arc<dyn AccessControl>,
    ) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let components = Components {
            factory: DeterministicFactory::new(&config.factory, storage.clone()),
            merkle: MerkleDistributor::new(storage.clone(), ledgers.clone()),
            snapshot: SnapshotDistributor::new(storage.clone(), ledgers),
            instances: Instances::new(storage.clone(), access),
            storage,
        };

        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("Metrics registry: {}", e)))?;

        let handle = spawn_distributor_actor(
            components.clone(),
            metrics.clone(),
            config.actor.mailbox_capacity,
        );

        tracing::info!(
            service = %config.service_name,
            factory = %components.factory.identity(),
            chain_context = components.factory.chain_context(),
            "Claim engine opened"
        );

        Ok(Self {
            handle,
            components,
            metrics,
            config,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Actor handle, for callers that want to share it across tasks
    pub fn handle(&self) -> DistributorHandle {
        self.handle.clone()
    }

    // Factory

    /// Factory identity
    pub fn factory_identity(&self) -> InstanceId {
        self.components.factory.identity()
    }

    /// One-shot factory initialization
    pub async fn initialize_factory(&self) -> Result<FactoryRecord> {
        self.handle.initialize_factory().await
    }

    /// Identity a provisioning request would produce
    pub fn predict_instance_id(
        &self,
        creator: &ParticipantId,
        salt: &Salt,
        code_identity: &Hash,
        init_args: &[u8],
    ) -> InstanceId {
        self.components
            .factory
            .predict_instance_id(creator, salt, code_identity, init_args)
    }

    /// Identity [`ClaimEngine::create`] would produce for `config`
    pub fn predict_created_id(
        &self,
        creator: &ParticipantId,
        salt: &Salt,
        config: &DistributorConfig,
    ) -> Result<InstanceId> {
        let init_args = config.encode()?;
        Ok(self.predict_instance_id(creator, salt, &config.kind().code_identity(), &init_args))
    }

    /// Provision an uninitialized instance
    pub async fn provision(
        &self,
        creator: ParticipantId,
        salt: Salt,
        code_identity: Hash,
        init_args: Vec<u8>,
    ) -> Result<InstanceRecord> {
        self.handle
            .provision(creator, salt, code_identity, init_args)
            .await
    }

    /// Provision and initialize atomically
    pub async fn create(
        &self,
        creator: ParticipantId,
        salt: Salt,
        config: DistributorConfig,
    ) -> Result<InstanceRecord> {
        self.handle.create(creator, salt, config).await
    }

    /// Does the factory support `tag`?
    pub fn factory_supports(&self, tag: CapabilityTag) -> bool {
        self.components.factory.supports(tag)
    }

    // Merkle variant

    /// Initialize a provisioned Merkle instance
    pub async fn initialize_merkle(
        &self,
        instance_id: InstanceId,
        root: Hash,
        pool_ledger: LedgerId,
        total_allocation: Entitlement,
    ) -> Result<MerkleCommitment> {
        self.handle
            .initialize_merkle(instance_id, root, pool_ledger, total_allocation)
            .await
    }

    /// Release a Merkle leaf
    pub async fn claim(
        &self,
        instance_id: InstanceId,
        participant: ParticipantId,
        entitlement: Entitlement,
        proof: Vec<Hash>,
    ) -> Result<MerkleClaimReceipt> {
        self.handle
            .claim(instance_id, participant, entitlement, proof)
            .await
    }

    /// Merkle commitment and counters
    pub fn merkle_commitment(&self, instance_id: &InstanceId) -> Result<MerkleCommitment> {
        self.components.merkle.commitment(instance_id)
    }

    /// Has the `(participant, entitlement)` leaf been claimed?
    pub fn is_claimed(
        &self,
        instance_id: &InstanceId,
        participant: &ParticipantId,
        entitlement: Entitlement,
    ) -> Result<bool> {
        self.components
            .merkle
            .is_claimed(instance_id, participant, entitlement)
    }

    // Snapshot variant

    /// Initialize a provisioned snapshot instance
    pub async fn initialize_snapshot(
        &self,
        instance_id: InstanceId,
        reference_ledger: LedgerId,
    ) -> Result<SnapshotDistributorState> {
        self.handle
            .initialize_snapshot(instance_id, reference_ledger)
            .await
    }

    /// Freeze the reference ledger and append a snapshot record
    pub async fn open_snapshot(
        &self,
        instance_id: InstanceId,
        pool_ledger: LedgerId,
        total_allocation: Entitlement,
    ) -> Result<SnapshotRecord> {
        self.handle
            .open_snapshot(instance_id, pool_ledger, total_allocation)
            .await
    }

    /// Amount `participant` could claim from `snap_id` now
    pub async fn calculate_claim_amount(
        &self,
        instance_id: &InstanceId,
        snap_id: SnapId,
        participant: &ParticipantId,
    ) -> Result<Entitlement> {
        self.components
            .snapshot
            .calculate_claim_amount(instance_id, snap_id, participant)
            .await
    }

    /// Release a pro-rata share
    pub async fn claim_snap(
        &self,
        instance_id: InstanceId,
        snap_id: SnapId,
        participant: ParticipantId,
    ) -> Result<SnapshotClaimReceipt> {
        self.handle
            .claim_snap(instance_id, snap_id, participant)
            .await
    }

    /// Snapshot record
    pub fn snapshot(&self, instance_id: &InstanceId, snap_id: SnapId) -> Result<SnapshotRecord> {
        self.components.snapshot.snapshot(instance_id, snap_id)
    }

    /// Highest issued `snap_id`
    pub fn latest_snap_id(&self, instance_id: &InstanceId) -> Result<SnapId> {
        self.components.snapshot.latest_snap_id(instance_id)
    }

    /// Has `participant` claimed under `snap_id`?
    pub fn is_snap_claimed(
        &self,
        instance_id: &InstanceId,
        snap_id: SnapId,
        participant: &ParticipantId,
    ) -> Result<bool> {
        self.components
            .snapshot
            .is_claimed(instance_id, snap_id, participant)
    }

    // Instances

    /// Instance record
    pub fn instance(&self, instance_id: &InstanceId) -> Result<InstanceRecord> {
        self.components.instances.get(instance_id)
    }

    /// Does the instance support `tag`?
    pub fn supports(&self, instance_id: &InstanceId, tag: CapabilityTag) -> Result<bool> {
        self.components.instances.supports(instance_id, tag)
    }

    /// Replace an instance's logic pointer
    pub async fn upgrade_to(
        &self,
        caller: ParticipantId,
        instance_id: InstanceId,
        new_logic: Hash,
    ) -> Result<InstanceRecord> {
        self.handle.upgrade_to(caller, instance_id, new_logic).await
    }

    // Observability

    /// Events in sequence order starting at `from`
    pub fn events(&self, from: u64, limit: usize) -> Result<Vec<DistributorEvent>> {
        self.components.storage.events(from, limit)
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.components.storage.get_stats()
    }

    /// Stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}
