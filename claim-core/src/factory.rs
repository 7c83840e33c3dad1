//! Deterministic factory
//!
//! Instance identities are content addresses:
//!
//! ```text
//! seed        = H(creator, creator, chain_context, salt)
//! init_hash   = H(code_identity, init_args)
//! instance_id = H(0xff, factory_identity, seed, init_hash)
//! ```
//!
//! so anyone holding the inputs can compute the identity before the instance
//! exists. Provisioning checks storage at that identity and refuses to write
//! over an occupant.

use crate::capability::{supports, Capability, CapabilityTag};
use crate::config::FactoryConfig;
use crate::crypto::{derive_instance_id, factory_identity, identity_seed, init_code_hash};
use crate::storage::Storage;
use crate::types::{
    DistributorKind, EventKind, Hash, InstanceId, InstanceRecord, ParticipantId, Salt,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persisted factory record (present once initialized)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryRecord {
    /// Factory identity
    pub identity: InstanceId,
    /// Chain context mixed into identity seeds
    pub chain_context: u64,
    /// Label the identity was derived from
    pub label: String,
    /// Initialization timestamp
    pub initialized_at: DateTime<Utc>,
}

/// Compute the identity a provisioning request would produce
pub fn predict_instance_id(
    factory: &InstanceId,
    chain_context: u64,
    creator: &ParticipantId,
    salt: &Salt,
    code_identity: &Hash,
    init_args: &[u8],
) -> InstanceId {
    let seed = identity_seed(creator, chain_context, salt);
    derive_instance_id(factory, &seed, &init_code_hash(code_identity, init_args))
}

/// Content-addressed instance provisioning
#[derive(Debug, Clone)]
pub struct DeterministicFactory {
    identity: InstanceId,
    chain_context: u64,
    label: String,
    storage: Arc<Storage>,
}

impl DeterministicFactory {
    /// Create factory over `storage`
    pub fn new(config: &FactoryConfig, storage: Arc<Storage>) -> Self {
        Self {
            identity: factory_identity(&config.label, config.chain_context),
            chain_context: config.chain_context,
            label: config.label.clone(),
            storage,
        }
    }

    /// Factory identity
    pub fn identity(&self) -> InstanceId {
        self.identity
    }

    /// Chain context
    pub fn chain_context(&self) -> u64 {
        self.chain_context
    }

    /// Identity `provision` would assign; touches no state
    pub fn predict_instance_id(
        &self,
        creator: &ParticipantId,
        salt: &Salt,
        code_identity: &Hash,
        init_args: &[u8],
    ) -> InstanceId {
        predict_instance_id(
            &self.identity,
            self.chain_context,
            creator,
            salt,
            code_identity,
            init_args,
        )
    }

    /// Has the factory been initialized?
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.storage.get_factory()?.is_some())
    }

    /// One-shot factory initialization
    pub fn initialize(&self) -> Result<FactoryRecord> {
        if let Some(existing) = self.storage.get_factory()? {
            return Err(Error::AlreadyInitialized(format!(
                "factory {} (since {})",
                existing.identity, existing.initialized_at
            )));
        }

        let record = FactoryRecord {
            identity: self.identity,
            chain_context: self.chain_context,
            label: self.label.clone(),
            initialized_at: Utc::now(),
        };

        let mut batch = self.storage.batch();
        batch.put_factory(&record)?;
        batch.push_event(
            self.identity,
            EventKind::FactoryInitialized {
                chain_context: self.chain_context,
            },
        );
        batch.commit()?;

        tracing::info!(factory = %self.identity, chain_context = self.chain_context, "Factory initialized");
        Ok(record)
    }

    /// Derive, check and build an uninitialized instance record without
    /// writing it
    pub fn prepare(
        &self,
        creator: &ParticipantId,
        salt: &Salt,
        code_identity: &Hash,
        init_args: &[u8],
    ) -> Result<InstanceRecord> {
        match self.storage.get_factory()? {
            Some(record) if record.identity == self.identity => {}
            Some(record) => {
                return Err(Error::Config(format!(
                    "Store belongs to factory {}, configured factory is {}",
                    record.identity, self.identity
                )))
            }
            None => return Err(Error::NotInitialized(format!("factory {}", self.identity))),
        }

        let kind = DistributorKind::from_code_identity(code_identity).ok_or_else(|| {
            Error::InvalidConfig(format!("Unknown code identity {}", hex::encode(code_identity)))
        })?;

        let instance_id = self.predict_instance_id(creator, salt, code_identity, init_args);
        if self.storage.instance_exists(&instance_id)? {
            return Err(Error::AlreadyProvisioned(instance_id));
        }

        Ok(InstanceRecord {
            instance_id,
            factory: self.identity,
            creator: *creator,
            salt: *salt,
            code_identity: *code_identity,
            init_args: init_args.to_vec(),
            kind,
            logic: *code_identity,
            initialized: false,
            created_at: Utc::now(),
            initialized_at: None,
        })
    }

    /// Provision an uninitialized instance at its derived identity
    pub fn provision(
        &self,
        creator: &ParticipantId,
        salt: &Salt,
        code_identity: &Hash,
        init_args: &[u8],
    ) -> Result<InstanceRecord> {
        let record = self.prepare(creator, salt, code_identity, init_args)?;

        let mut batch = self.storage.batch();
        batch.put_instance(&record)?;
        batch.push_event(record.instance_id, created_event(&record));
        batch.commit()?;

        tracing::info!(
            instance_id = %record.instance_id,
            creator = %record.creator,
            kind = %record.kind,
            "Instance provisioned"
        );
        Ok(record)
    }

    /// Capability query for the factory itself
    pub fn supports(&self, tag: CapabilityTag) -> bool {
        supports(Capability::factory_set(), tag)
    }
}

/// Creation event for a freshly provisioned record
pub(crate) fn created_event(record: &InstanceRecord) -> EventKind {
    EventKind::InstanceCreated {
        creator: record.creator,
        code_identity: record.code_identity,
    }
}
