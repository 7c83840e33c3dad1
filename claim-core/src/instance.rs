//! Instance lifecycle shared by both distributor variants
//!
//! Loading records, the one-shot initialization transition, capability
//! queries, and the one privileged operation: replacing the logic pointer.

use crate::access::{AccessControl, OP_UPGRADE_TO};
use crate::capability::{supports, Capability, CapabilityTag};
use crate::storage::{StateBatch, Storage};
use crate::types::{
    DistributorConfig, DistributorState, EventKind, Hash, InstanceId, InstanceRecord,
    ParticipantId,
};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;

/// Load an instance record or fail with `UnknownInstance`
pub fn load_instance(storage: &Storage, instance_id: &InstanceId) -> Result<InstanceRecord> {
    storage
        .get_instance(instance_id)?
        .ok_or(Error::UnknownInstance(*instance_id))
}

/// Fail with `AlreadyInitialized` if the instance was initialized before
pub fn require_uninitialized(record: &InstanceRecord) -> Result<()> {
    if record.initialized {
        return Err(Error::AlreadyInitialized(format!(
            "instance {}",
            record.instance_id
        )));
    }
    Ok(())
}

/// Fail with `InvalidConfig` unless `config` is what the instance's identity
/// was derived from
///
/// Instances provisioned with empty `init_args` accept any configuration.
pub fn require_committed_config(
    record: &InstanceRecord,
    config: &DistributorConfig,
) -> Result<()> {
    if record.init_args.is_empty() {
        return Ok(());
    }
    let committed = DistributorConfig::decode(&record.init_args)?;
    if &committed != config {
        return Err(Error::InvalidConfig(format!(
            "Configuration differs from the init args of instance {}",
            record.instance_id
        )));
    }
    Ok(())
}

/// Stage the uninitialized → initialized transition together with the
/// variant's initial state
pub fn stage_initialization(
    batch: &mut StateBatch<'_>,
    record: &mut InstanceRecord,
    state: &DistributorState,
) -> Result<()> {
    record.initialized = true;
    record.initialized_at = Some(Utc::now());

    batch.put_instance(record)?;
    batch.put_state(&record.instance_id, state)?;
    batch.push_event(record.instance_id, EventKind::Initialized { kind: record.kind });
    Ok(())
}

/// Authorization-gated instance administration
#[derive(Clone)]
pub struct Instances {
    storage: Arc<Storage>,
    access: Arc<dyn AccessControl>,
}

impl std::fmt::Debug for Instances {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instances").finish_non_exhaustive()
    }
}

impl Instances {
    /// Create over storage and an authorization oracle
    pub fn new(storage: Arc<Storage>, access: Arc<dyn AccessControl>) -> Self {
        Self { storage, access }
    }

    /// Instance record
    pub fn get(&self, instance_id: &InstanceId) -> Result<InstanceRecord> {
        load_instance(&self.storage, instance_id)
    }

    /// Capability query for an instance
    pub fn supports(&self, instance_id: &InstanceId, tag: CapabilityTag) -> Result<bool> {
        let record = self.get(instance_id)?;
        Ok(supports(Capability::distributor_set(record.kind), tag))
    }

    /// Replace the instance's logic pointer
    ///
    /// `caller` must be authorized for `upgradeTo` on this instance.
    pub async fn upgrade_to(
        &self,
        caller: &ParticipantId,
        instance_id: &InstanceId,
        new_logic: Hash,
    ) -> Result<InstanceRecord> {
        let mut record = self.get(instance_id)?;

        if !self
            .access
            .is_authorized(caller, instance_id, OP_UPGRADE_TO)
            .await?
        {
            tracing::warn!(caller = %caller, instance_id = %instance_id, "Upgrade rejected");
            return Err(Error::NotAuthorized {
                caller: *caller,
                target: *instance_id,
                operation: OP_UPGRADE_TO.to_string(),
            });
        }

        if new_logic == [0u8; 32] {
            return Err(Error::InvalidConfig("Logic pointer must not be zero".to_string()));
        }

        record.logic = new_logic;

        let mut batch = self.storage.batch();
        batch.put_instance(&record)?;
        batch.push_event(
            *instance_id,
            EventKind::Upgraded {
                new_logic,
                caller: *caller,
            },
        );
        batch.commit()?;

        tracing::info!(
            instance_id = %instance_id,
            caller = %caller,
            new_logic = %hex::encode(new_logic),
            "Logic upgraded"
        );
        Ok(record)
    }
}
