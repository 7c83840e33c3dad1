//! Single-writer actor for state transitions
//!
//! Every mutating operation is a message handled by one task, so the
//! verify → commit → transfer sequence of a claim never interleaves with
//! another mutation. Reads bypass the actor and go straight to storage.
//!
//! ```text
//!   DistributorHandle (Clone) ──► mpsc (bounded) ──► DistributorActor
//!                                                        │
//!                                                        ▼
//!                                        factory / merkle / snapshot /
//!                                        instances ──► StateBatch::commit
//! ```

use crate::factory::{created_event, DeterministicFactory, FactoryRecord};
use crate::instance::{stage_initialization, Instances};
use crate::merkle_distributor::{MerkleClaimReceipt, MerkleDistributor};
use crate::metrics::Metrics;
use crate::snapshot_distributor::{SnapshotClaimReceipt, SnapshotDistributor};
use crate::storage::Storage;
use crate::types::{
    DistributorConfig, DistributorKind, DistributorState, Entitlement, Hash, InstanceId,
    InstanceRecord, LedgerId, MerkleCommitment, ParticipantId, Salt, SnapId,
    SnapshotDistributorState, SnapshotRecord,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Message sent to the distributor actor
#[derive(Debug)]
pub enum DistributorMessage {
    /// One-shot factory initialization
    InitializeFactory {
        /// Reply channel
        response: Reply<FactoryRecord>,
    },

    /// Provision an uninitialized instance
    Provision {
        /// Creator
        creator: ParticipantId,
        /// Salt
        salt: Salt,
        /// Code identity to install
        code_identity: Hash,
        /// Opaque init args
        init_args: Vec<u8>,
        /// Reply channel
        response: Reply<InstanceRecord>,
    },

    /// Provision and initialize in one step
    Create {
        /// Creator
        creator: ParticipantId,
        /// Salt
        salt: Salt,
        /// Typed configuration
        config: DistributorConfig,
        /// Reply channel
        response: Reply<InstanceRecord>,
    },

    /// Initialize a Merkle instance
    InitializeMerkle {
        /// Target instance
        instance_id: InstanceId,
        /// Committed root
        root: Hash,
        /// Pool ledger
        pool_ledger: LedgerId,
        /// Declared allocation
        total_allocation: Entitlement,
        /// Reply channel
        response: Reply<MerkleCommitment>,
    },

    /// Initialize a snapshot instance
    InitializeSnapshot {
        /// Target instance
        instance_id: InstanceId,
        /// Reference ledger
        reference_ledger: LedgerId,
        /// Reply channel
        response: Reply<SnapshotDistributorState>,
    },

    /// Merkle claim
    Claim {
        /// Target instance
        instance_id: InstanceId,
        /// Beneficiary
        participant: ParticipantId,
        /// Leaf entitlement
        entitlement: Entitlement,
        /// Sibling path
        proof: Vec<Hash>,
        /// Reply channel
        response: Reply<MerkleClaimReceipt>,
    },

    /// Append a snapshot record
    OpenSnapshot {
        /// Target instance
        instance_id: InstanceId,
        /// Pool ledger
        pool_ledger: LedgerId,
        /// Allocation
        total_allocation: Entitlement,
        /// Reply channel
        response: Reply<SnapshotRecord>,
    },

    /// Pro-rata claim
    ClaimSnap {
        /// Target instance
        instance_id: InstanceId,
        /// Snapshot
        snap_id: SnapId,
        /// Beneficiary
        participant: ParticipantId,
        /// Reply channel
        response: Reply<SnapshotClaimReceipt>,
    },

    /// Replace logic pointer
    UpgradeTo {
        /// Caller whose authorization is checked
        caller: ParticipantId,
        /// Target instance
        instance_id: InstanceId,
        /// New logic
        new_logic: Hash,
        /// Reply channel
        response: Reply<InstanceRecord>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Components the actor drives
#[derive(Debug, Clone)]
pub struct Components {
    /// Storage backend
    pub storage: Arc<Storage>,
    /// Deterministic factory
    pub factory: DeterministicFactory,
    /// Merkle variant
    pub merkle: MerkleDistributor,
    /// Snapshot variant
    pub snapshot: SnapshotDistributor,
    /// Instance administration
    pub instances: Instances,
}

/// Actor that processes distributor messages
pub struct DistributorActor {
    components: Components,
    metrics: Metrics,
    mailbox: mpsc::Receiver<DistributorMessage>,
}

impl std::fmt::Debug for DistributorActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributorActor")
            .field("components", &self.components)
            .finish_non_exhaustive()
    }
}

impl DistributorActor {
    /// Create new actor
    pub fn new(
        components: Components,
        metrics: Metrics,
        mailbox: mpsc::Receiver<DistributorMessage>,
    ) -> Self {
        Self {
            components,
            metrics,
            mailbox,
        }
    }

    /// Run the actor event loop until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            if let DistributorMessage::Shutdown = msg {
                tracing::info!("Distributor actor shutting down");
                break;
            }
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&self, msg: DistributorMessage) {
        let c = &self.components;

        match msg {
            DistributorMessage::InitializeFactory { response } => {
                let result = c.factory.initialize();
                self.reply(response, result);
            }

            DistributorMessage::Provision {
                creator,
                salt,
                code_identity,
                init_args,
                response,
            } => {
                let result = c.factory.provision(&creator, &salt, &code_identity, &init_args);
                if result.is_ok() {
                    self.metrics.record_provisioned();
                }
                self.reply(response, result);
            }

            DistributorMessage::Create {
                creator,
                salt,
                config,
                response,
            } => {
                let result = self.create(creator, salt, config).await;
                if result.is_ok() {
                    self.metrics.record_provisioned();
                }
                self.reply(response, result);
            }

            DistributorMessage::InitializeMerkle {
                instance_id,
                root,
                pool_ledger,
                total_allocation,
                response,
            } => {
                let result = c
                    .merkle
                    .initialize(&instance_id, root, pool_ledger, total_allocation)
                    .await;
                self.reply(response, result);
            }

            DistributorMessage::InitializeSnapshot {
                instance_id,
                reference_ledger,
                response,
            } => {
                let result = c.snapshot.initialize(&instance_id, reference_ledger);
                self.reply(response, result);
            }

            DistributorMessage::Claim {
                instance_id,
                participant,
                entitlement,
                proof,
                response,
            } => {
                let started = Instant::now();
                let result = c
                    .merkle
                    .claim(&instance_id, &participant, entitlement, &proof)
                    .await;
                if result.is_ok() {
                    self.metrics
                        .record_claim(DistributorKind::Merkle, started.elapsed().as_secs_f64());
                }
                self.reply(response, result);
            }

            DistributorMessage::OpenSnapshot {
                instance_id,
                pool_ledger,
                total_allocation,
                response,
            } => {
                let result = c
                    .snapshot
                    .open_snapshot(&instance_id, pool_ledger, total_allocation)
                    .await;
                if result.is_ok() {
                    self.metrics.record_snapshot_opened();
                }
                self.reply(response, result);
            }

            DistributorMessage::ClaimSnap {
                instance_id,
                snap_id,
                participant,
                response,
            } => {
                let started = Instant::now();
                let result = c
                    .snapshot
                    .claim_snap(&instance_id, snap_id, &participant)
                    .await;
                if result.is_ok() {
                    self.metrics
                        .record_claim(DistributorKind::Snapshot, started.elapsed().as_secs_f64());
                }
                self.reply(response, result);
            }

            DistributorMessage::UpgradeTo {
                caller,
                instance_id,
                new_logic,
                response,
            } => {
                let result = c.instances.upgrade_to(&caller, &instance_id, new_logic).await;
                if result.is_ok() {
                    self.metrics.record_upgrade();
                }
                self.reply(response, result);
            }

            DistributorMessage::Shutdown => {
                // Handled in run loop
            }
        }
    }

    /// Provision and initialize atomically; nothing is written on failure
    async fn create(
        &self,
        creator: ParticipantId,
        salt: Salt,
        config: DistributorConfig,
    ) -> Result<InstanceRecord> {
        let c = &self.components;
        let kind = config.kind();
        let init_args = config.encode()?;
        let mut record = c
            .factory
            .prepare(&creator, &salt, &kind.code_identity(), &init_args)?;

        let state = match config {
            DistributorConfig::Merkle {
                root,
                pool_ledger,
                total_allocation,
            } => DistributorState::Merkle(
                c.merkle
                    .prepare_initialize(&record, root, pool_ledger, total_allocation)
                    .await?,
            ),
            DistributorConfig::Snapshot { reference_ledger } => DistributorState::Snapshot(
                c.snapshot.prepare_initialize(&record, reference_ledger)?,
            ),
        };

        let mut batch = c.storage.batch();
        batch.push_event(record.instance_id, created_event(&record));
        stage_initialization(&mut batch, &mut record, &state)?;
        batch.commit()?;

        tracing::info!(
            instance_id = %record.instance_id,
            creator = %record.creator,
            kind = %record.kind,
            "Instance created"
        );
        Ok(record)
    }

    fn reply<T>(&self, response: Reply<T>, result: Result<T>) {
        if let Err(e) = &result {
            self.metrics.record_rejection(e.code());
            tracing::warn!(code = e.code(), error = %e, "Operation rejected");
        }
        // Caller may have given up waiting
        let _ = response.send(result);
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct DistributorHandle {
    sender: mpsc::Sender<DistributorMessage>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DistributorHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<DistributorMessage>, task: JoinHandle<()>) -> Self {
        Self {
            sender,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> DistributorMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Initialize the factory
    pub async fn initialize_factory(&self) -> Result<FactoryRecord> {
        self.request(|response| DistributorMessage::InitializeFactory { response })
            .await
    }

    /// Provision an uninitialized instance
    pub async fn provision(
        &self,
        creator: ParticipantId,
        salt: Salt,
        code_identity: Hash,
        init_args: Vec<u8>,
    ) -> Result<InstanceRecord> {
        self.request(|response| DistributorMessage::Provision {
            creator,
            salt,
            code_identity,
            init_args,
            response,
        })
        .await
    }

    /// Provision and initialize in one step
    pub async fn create(
        &self,
        creator: ParticipantId,
        salt: Salt,
        config: DistributorConfig,
    ) -> Result<InstanceRecord> {
        self.request(|response| DistributorMessage::Create {
            creator,
            salt,
            config,
            response,
        })
        .await
    }

    /// Initialize a Merkle instance
    pub async fn initialize_merkle(
        &self,
        instance_id: InstanceId,
        root: Hash,
        pool_ledger: LedgerId,
        total_allocation: Entitlement,
    ) -> Result<MerkleCommitment> {
        self.request(|response| DistributorMessage::InitializeMerkle {
            instance_id,
            root,
            pool_ledger,
            total_allocation,
            response,
        })
        .await
    }

    /// Initialize a snapshot instance
    pub async fn initialize_snapshot(
        &self,
        instance_id: InstanceId,
        reference_ledger: LedgerId,
    ) -> Result<SnapshotDistributorState> {
        self.request(|response| DistributorMessage::InitializeSnapshot {
            instance_id,
            reference_ledger,
            response,
        })
        .await
    }

    /// Merkle claim
    pub async fn claim(
        &self,
        instance_id: InstanceId,
        participant: ParticipantId,
        entitlement: Entitlement,
        proof: Vec<Hash>,
    ) -> Result<MerkleClaimReceipt> {
        self.request(|response| DistributorMessage::Claim {
            instance_id,
            participant,
            entitlement,
            proof,
            response,
        })
        .await
    }

    /// Append a snapshot record
    pub async fn open_snapshot(
        &self,
        instance_id: InstanceId,
        pool_ledger: LedgerId,
        total_allocation: Entitlement,
    ) -> Result<SnapshotRecord> {
        self.request(|response| DistributorMessage::OpenSnapshot {
            instance_id,
            pool_ledger,
            total_allocation,
            response,
        })
        .await
    }

    /// Pro-rata claim
    pub async fn claim_snap(
        &self,
        instance_id: InstanceId,
        snap_id: SnapId,
        participant: ParticipantId,
    ) -> Result<SnapshotClaimReceipt> {
        self.request(|response| DistributorMessage::ClaimSnap {
            instance_id,
            snap_id,
            participant,
            response,
        })
        .await
    }

    /// Replace logic pointer
    pub async fn upgrade_to(
        &self,
        caller: ParticipantId,
        instance_id: InstanceId,
        new_logic: Hash,
    ) -> Result<InstanceRecord> {
        self.request(|response| DistributorMessage::UpgradeTo {
            caller,
            instance_id,
            new_logic,
            response,
        })
        .await
    }

    /// Shutdown actor and wait until it has released its components
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(DistributorMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Concurrency(format!("Actor task failed: {}", e)))?;
        }
        Ok(())
    }
}

/// Spawn the distributor actor
pub fn spawn_distributor_actor(
    components: Components,
    metrics: Metrics,
    mailbox_capacity: usize,
) -> DistributorHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity);
    let actor = DistributorActor::new(components, metrics, rx);

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    DistributorHandle::new(tx, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::RoleRegistry;
    use crate::ledger::{Ledgers, MemoryLedger};
    use crate::Config;

    fn spawn(config: &Config, ledgers: Ledgers) -> (DistributorHandle, Arc<Storage>, Metrics) {
        let storage = Arc::new(Storage::open(config).unwrap());
        let components = Components {
            storage: storage.clone(),
            factory: DeterministicFactory::new(&config.factory, storage.clone()),
            merkle: MerkleDistributor::new(storage.clone(), ledgers.clone()),
            snapshot: SnapshotDistributor::new(storage.clone(), ledgers),
            instances: Instances::new(storage.clone(), Arc::new(RoleRegistry::new())),
        };
        let metrics = Metrics::new().unwrap();
        let handle = spawn_distributor_actor(components, metrics.clone(), 16);
        (handle, storage, metrics)
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let (handle, storage, _metrics) = spawn(&config, Ledgers::new());
        handle.shutdown().await.unwrap();

        // The actor's storage handle is gone once shutdown returns
        assert_eq!(Arc::strong_count(&storage), 1);
        assert!(matches!(
            handle.initialize_factory().await,
            Err(Error::Concurrency(_))
        ));
    }

    #[tokio::test]
    async fn test_create_failure_leaves_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let ledgers = Ledgers::new().with_snapshot(LedgerId::new("DCNT"), Arc::new(MemoryLedger::new()));
        let (handle, storage, metrics) = spawn(&config, ledgers);
        handle.initialize_factory().await.unwrap();

        let creator = ParticipantId::from_bytes([1u8; 32]);
        let err = handle
            .create(
                creator,
                [5u8; 32],
                DistributorConfig::Merkle {
                    root: [1u8; 32],
                    pool_ledger: LedgerId::new("DCNT"),
                    total_allocation: 10,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientCustody { .. }));
        assert_eq!(
            metrics
                .rejected_total
                .with_label_values(&["insufficient_custody"])
                .get(),
            1
        );

        // Only the factory event exists
        assert_eq!(storage.events(0, 10).unwrap().len(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_snapshot_instance() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let ledgers = Ledgers::new().with_snapshot(LedgerId::new("DCNT"), Arc::new(MemoryLedger::new()));
        let (handle, storage, metrics) = spawn(&config, ledgers);
        handle.initialize_factory().await.unwrap();

        let record = handle
            .create(
                ParticipantId::from_bytes([1u8; 32]),
                [5u8; 32],
                DistributorConfig::Snapshot {
                    reference_ledger: LedgerId::new("DCNT"),
                },
            )
            .await
            .unwrap();
        assert!(record.initialized);
        assert_eq!(record.kind, DistributorKind::Snapshot);
        assert_eq!(metrics.provisioned_total.get(), 1);

        let events = storage.events(1, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.instance_id == record.instance_id));

        handle.shutdown().await.unwrap();
    }
}
