//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `meta` - Factory record (key: `factory`)
//! - `instances` - Provisioned instances (key: instance_id)
//! - `state` - Distributor state, Merkle commitment or snapshot header (key: instance_id)
//! - `merkle_claims` - Claimed leaves (key: instance_id || leaf)
//! - `snapshots` - Snapshot records (key: instance_id || snap_id)
//! - `snapshot_claims` - Claimed holders (key: instance_id || snap_id || participant)
//! - `events` - Append-only event log (key: sequence)
//!
//! All multi-byte integers in keys are big-endian so iteration order is
//! numeric order. Every mutation goes through a [`StateBatch`], committed as
//! one RocksDB `WriteBatch`.

use crate::{
    error::{Error, Result},
    factory::FactoryRecord,
    types::{
        DistributorEvent, DistributorState, Entitlement, EventKind, Hash, InstanceId,
        InstanceRecord, ParticipantId, SnapId, SnapshotRecord,
    },
    Config,
};
use chrono::Utc;
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_META: &str = "meta";
const CF_INSTANCES: &str = "instances";
const CF_STATE: &str = "state";
const CF_MERKLE_CLAIMS: &str = "merkle_claims";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_SNAPSHOT_CLAIMS: &str = "snapshot_claims";
const CF_EVENTS: &str = "events";

const ALL_CFS: [&str; 7] = [
    CF_META,
    CF_INSTANCES,
    CF_STATE,
    CF_MERKLE_CLAIMS,
    CF_SNAPSHOTS,
    CF_SNAPSHOT_CLAIMS,
    CF_EVENTS,
];

const META_FACTORY: &[u8] = b"factory";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    /// Next event sequence; held for the duration of a commit
    next_sequence: Mutex<u64>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("next_sequence", &*self.next_sequence.lock())
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let next_sequence = Self::load_next_sequence(&db)?;

        tracing::info!(
            path = ?path,
            column_families = ALL_CFS.len(),
            next_sequence,
            "Opened RocksDB"
        );

        Ok(Self {
            db: Arc::new(db),
            next_sequence: Mutex::new(next_sequence),
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Claimed-set checks are point lookups on hot keys
            CF_MERKLE_CLAIMS | CF_SNAPSHOT_CLAIMS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            CF_EVENTS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn load_next_sequence(db: &DB) -> Result<u64> {
        let cf = db
            .cf_handle(CF_EVENTS)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", CF_EVENTS)))?;

        match db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(decode_u64(&key)? + 1)
            }
            None => Ok(0),
        }
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn key_exists(&self, cf: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf_handle(cf)?;
        Ok(self.db.get_pinned_cf(cf, key)?.is_some())
    }

    // Reads

    /// Factory record, if the factory was initialized
    pub fn get_factory(&self) -> Result<Option<FactoryRecord>> {
        self.get_value(CF_META, META_FACTORY)
    }

    /// Instance record by identity
    pub fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<InstanceRecord>> {
        self.get_value(CF_INSTANCES, instance_id.as_bytes())
    }

    /// Occupancy check for a derived identity
    pub fn instance_exists(&self, instance_id: &InstanceId) -> Result<bool> {
        self.key_exists(CF_INSTANCES, instance_id.as_bytes())
    }

    /// Distributor state by instance
    pub fn get_state(&self, instance_id: &InstanceId) -> Result<Option<DistributorState>> {
        self.get_value(CF_STATE, instance_id.as_bytes())
    }

    /// Is `leaf` in the instance's claimed set?
    pub fn is_leaf_claimed(&self, instance_id: &InstanceId, leaf: &Hash) -> Result<bool> {
        self.key_exists(CF_MERKLE_CLAIMS, &merkle_claim_key(instance_id, leaf))
    }

    /// Snapshot record by id
    pub fn get_snapshot(
        &self,
        instance_id: &InstanceId,
        snap_id: SnapId,
    ) -> Result<Option<SnapshotRecord>> {
        self.get_value(CF_SNAPSHOTS, &snapshot_key(instance_id, snap_id))
    }

    /// Has `participant` claimed under `snap_id`?
    pub fn is_snap_claimed(
        &self,
        instance_id: &InstanceId,
        snap_id: SnapId,
        participant: &ParticipantId,
    ) -> Result<bool> {
        self.key_exists(
            CF_SNAPSHOT_CLAIMS,
            &snapshot_claim_key(instance_id, snap_id, participant),
        )
    }

    /// Events in sequence order, starting at `from`
    pub fn events(&self, from: u64, limit: usize) -> Result<Vec<DistributorEvent>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        let start = from.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));

        let mut events = Vec::new();
        for item in iter.take(limit) {
            let (_, value) = item?;
            events.push(bincode::deserialize(&value)?);
        }
        Ok(events)
    }

    /// Start a batch of mutations
    pub fn batch(&self) -> StateBatch<'_> {
        StateBatch {
            storage: self,
            batch: WriteBatch::default(),
            events: Vec::new(),
        }
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_instances: self.approximate_count(self.cf_handle(CF_INSTANCES)?)?,
            total_merkle_claims: self.approximate_count(self.cf_handle(CF_MERKLE_CLAIMS)?)?,
            total_snapshot_claims: self.approximate_count(self.cf_handle(CF_SNAPSHOT_CLAIMS)?)?,
            total_events: *self.next_sequence.lock(),
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }
}

/// Pending mutations, applied atomically by [`StateBatch::commit`]
pub struct StateBatch<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
    events: Vec<(InstanceId, EventKind)>,
}

impl<'a> StateBatch<'a> {
    /// Record the factory
    pub fn put_factory(&mut self, record: &FactoryRecord) -> Result<()> {
        let cf = self.storage.cf_handle(CF_META)?;
        self.batch.put_cf(cf, META_FACTORY, bincode::serialize(record)?);
        Ok(())
    }

    /// Write an instance record
    pub fn put_instance(&mut self, record: &InstanceRecord) -> Result<()> {
        let cf = self.storage.cf_handle(CF_INSTANCES)?;
        self.batch
            .put_cf(cf, record.instance_id.as_bytes(), bincode::serialize(record)?);
        Ok(())
    }

    /// Write distributor state
    pub fn put_state(&mut self, instance_id: &InstanceId, state: &DistributorState) -> Result<()> {
        let cf = self.storage.cf_handle(CF_STATE)?;
        self.batch
            .put_cf(cf, instance_id.as_bytes(), bincode::serialize(state)?);
        Ok(())
    }

    /// Insert `leaf` into the claimed set
    pub fn mark_leaf_claimed(
        &mut self,
        instance_id: &InstanceId,
        leaf: &Hash,
        amount: Entitlement,
    ) -> Result<()> {
        let cf = self.storage.cf_handle(CF_MERKLE_CLAIMS)?;
        self.batch.put_cf(
            cf,
            merkle_claim_key(instance_id, leaf),
            bincode::serialize(&amount)?,
        );
        Ok(())
    }

    /// Remove `leaf` from the claimed set
    pub fn clear_leaf_claimed(&mut self, instance_id: &InstanceId, leaf: &Hash) -> Result<()> {
        let cf = self.storage.cf_handle(CF_MERKLE_CLAIMS)?;
        self.batch.delete_cf(cf, merkle_claim_key(instance_id, leaf));
        Ok(())
    }

    /// Write a snapshot record
    pub fn put_snapshot(&mut self, instance_id: &InstanceId, record: &SnapshotRecord) -> Result<()> {
        let cf = self.storage.cf_handle(CF_SNAPSHOTS)?;
        self.batch.put_cf(
            cf,
            snapshot_key(instance_id, record.snap_id),
            bincode::serialize(record)?,
        );
        Ok(())
    }

    /// Mark `participant` as claimed under `snap_id`
    pub fn mark_snap_claimed(
        &mut self,
        instance_id: &InstanceId,
        snap_id: SnapId,
        participant: &ParticipantId,
        amount: Entitlement,
    ) -> Result<()> {
        let cf = self.storage.cf_handle(CF_SNAPSHOT_CLAIMS)?;
        self.batch.put_cf(
            cf,
            snapshot_claim_key(instance_id, snap_id, participant),
            bincode::serialize(&amount)?,
        );
        Ok(())
    }

    /// Remove the claim marker of `participant` under `snap_id`
    pub fn clear_snap_claimed(
        &mut self,
        instance_id: &InstanceId,
        snap_id: SnapId,
        participant: &ParticipantId,
    ) -> Result<()> {
        let cf = self.storage.cf_handle(CF_SNAPSHOT_CLAIMS)?;
        self.batch
            .delete_cf(cf, snapshot_claim_key(instance_id, snap_id, participant));
        Ok(())
    }

    /// Queue an event; its sequence is assigned at commit
    pub fn push_event(&mut self, instance_id: InstanceId, kind: EventKind) {
        self.events.push((instance_id, kind));
    }

    /// Apply all mutations atomically and return the committed events
    pub fn commit(self) -> Result<Vec<DistributorEvent>> {
        let StateBatch {
            storage,
            mut batch,
            events,
        } = self;

        let cf_events = storage.cf_handle(CF_EVENTS)?;
        let mut next_sequence = storage.next_sequence.lock();
        let recorded_at = Utc::now();

        let mut committed = Vec::with_capacity(events.len());
        for (offset, (instance_id, kind)) in events.into_iter().enumerate() {
            let event = DistributorEvent {
                event_id: Uuid::now_v7(),
                sequence: *next_sequence + offset as u64,
                instance_id,
                kind,
                recorded_at,
            };
            batch.put_cf(cf_events, event.sequence.to_be_bytes(), bincode::serialize(&event)?);
            committed.push(event);
        }

        storage.db.write(batch)?;
        *next_sequence += committed.len() as u64;

        Ok(committed)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Provisioned instances (approximate)
    pub total_instances: u64,
    /// Claimed leaves (approximate)
    pub total_merkle_claims: u64,
    /// Claimed snapshot entitlements (approximate)
    pub total_snapshot_claims: u64,
    /// Events in the log
    pub total_events: u64,
}

// Key helpers

fn merkle_claim_key(instance_id: &InstanceId, leaf: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(instance_id.as_bytes());
    key.extend_from_slice(leaf);
    key
}

fn snapshot_key(instance_id: &InstanceId, snap_id: SnapId) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(instance_id.as_bytes());
    key.extend_from_slice(&snap_id.to_be_bytes());
    key
}

fn snapshot_claim_key(instance_id: &InstanceId, snap_id: SnapId, participant: &ParticipantId) -> Vec<u8> {
    let mut key = snapshot_key(instance_id, snap_id);
    key.extend_from_slice(participant.as_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("Malformed sequence key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DistributorKind, LedgerId, MerkleCommitment};
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (config, temp_dir)
    }

    fn test_instance(byte: u8) -> InstanceRecord {
        let kind = DistributorKind::Merkle;
        InstanceRecord {
            instance_id: InstanceId::from_bytes([byte; 32]),
            factory: InstanceId::from_bytes([0u8; 32]),
            creator: ParticipantId::from_bytes([1u8; 32]),
            salt: [2u8; 32],
            code_identity: kind.code_identity(),
            init_args: vec![],
            kind,
            logic: kind.code_identity(),
            initialized: false,
            created_at: Utc::now(),
            initialized_at: None,
        }
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        for name in ALL_CFS {
            assert!(storage.db.cf_handle(name).is_some());
        }
    }

    #[test]
    fn test_instance_roundtrip_and_exists() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let record = test_instance(5);

        assert!(!storage.instance_exists(&record.instance_id).unwrap());

        let mut batch = storage.batch();
        batch.put_instance(&record).unwrap();
        batch.commit().unwrap();

        assert!(storage.instance_exists(&record.instance_id).unwrap());
        let loaded = storage.get_instance(&record.instance_id).unwrap().unwrap();
        assert_eq!(loaded.instance_id, record.instance_id);
        assert_eq!(loaded.kind, DistributorKind::Merkle);
    }

    #[test]
    fn test_uncommitted_batch_has_no_effect() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let record = test_instance(6);

        {
            let mut batch = storage.batch();
            batch.put_instance(&record).unwrap();
            batch.push_event(record.instance_id, EventKind::Initialized { kind: record.kind });
        }

        assert!(storage.get_instance(&record.instance_id).unwrap().is_none());
        assert!(storage.events(0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_claim_keys_are_scoped() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let a = InstanceId::from_bytes([1u8; 32]);
        let b = InstanceId::from_bytes([2u8; 32]);
        let who = ParticipantId::from_bytes([3u8; 32]);
        let leaf = [4u8; 32];

        let mut batch = storage.batch();
        batch.mark_leaf_claimed(&a, &leaf, 10).unwrap();
        batch.mark_snap_claimed(&a, 1, &who, 10).unwrap();
        batch.commit().unwrap();

        assert!(storage.is_leaf_claimed(&a, &leaf).unwrap());
        assert!(!storage.is_leaf_claimed(&b, &leaf).unwrap());
        assert!(storage.is_snap_claimed(&a, 1, &who).unwrap());
        assert!(!storage.is_snap_claimed(&a, 2, &who).unwrap());

        let mut batch = storage.batch();
        batch.clear_leaf_claimed(&a, &leaf).unwrap();
        batch.clear_snap_claimed(&a, 1, &who).unwrap();
        batch.commit().unwrap();

        assert!(!storage.is_leaf_claimed(&a, &leaf).unwrap());
        assert!(!storage.is_snap_claimed(&a, 1, &who).unwrap());
    }

    #[test]
    fn test_state_roundtrip() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let id = InstanceId::from_bytes([1u8; 32]);
        let state = DistributorState::Merkle(MerkleCommitment {
            root: [9u8; 32],
            pool_ledger: LedgerId::new("DCNT"),
            total_allocation: 250,
            claimed_count: 0,
            total_claimed: 0,
        });

        let mut batch = storage.batch();
        batch.put_state(&id, &state).unwrap();
        batch.commit().unwrap();

        assert_eq!(storage.get_state(&id).unwrap(), Some(state));
    }

    #[test]
    fn test_event_sequence_survives_reopen() {
        let (config, _temp) = test_config();
        let id = InstanceId::from_bytes([1u8; 32]);

        {
            let storage = Storage::open(&config).unwrap();
            let mut batch = storage.batch();
            batch.push_event(id, EventKind::Initialized { kind: DistributorKind::Merkle });
            batch.push_event(id, EventKind::Initialized { kind: DistributorKind::Snapshot });
            let events = batch.commit().unwrap();
            assert_eq!(events[0].sequence, 0);
            assert_eq!(events[1].sequence, 1);
        }

        let storage = Storage::open(&config).unwrap();
        let mut batch = storage.batch();
        batch.push_event(id, EventKind::Initialized { kind: DistributorKind::Merkle });
        let events = batch.commit().unwrap();
        assert_eq!(events[0].sequence, 2);

        let all = storage.events(0, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(storage.events(2, 10).unwrap().len(), 1);
    }
}
