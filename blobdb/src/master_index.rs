//! The shared registry of collection metadata, locks, and modification
//! history. A `MasterIndex` is the only component that reads or writes the
//! property-bag key holding this state; every operation reloads the
//! record before mutating it, since another process may have written to
//! the same key since the last read.

use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration as StdDuration;

use blobdb_common::{DbError, DbResult};
use blobdb_store::PropertyBagClient;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids;

/// Bounded history retention per collection: oldest entries are dropped once
/// a collection's history exceeds this many entries.
pub const MAX_HISTORY_ENTRIES: usize = 10;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LockStatus {
    pub is_locked: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// The instant at which the lock is considered stale, not a duration.
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl LockStatus {
    fn unlocked() -> Self {
        LockStatus::default()
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lock_expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CollectionMetadata {
    pub name: String,
    pub file_id: String,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub document_count: u64,
    pub modification_token: String,
    #[serde(default)]
    pub lock_status: LockStatus,
}

impl CollectionMetadata {
    pub fn new(name: impl Into<String>, file_id: impl Into<String>) -> Self {
        let now = Utc::now();
        CollectionMetadata {
            name: name.into(),
            file_id: file_id.into(),
            created: now,
            last_updated: now,
            document_count: 0,
            modification_token: ids::new_id(),
            lock_status: LockStatus::unlocked(),
        }
    }
}

/// A partial update to a [`CollectionMetadata`] record; absent fields are
/// left untouched.
#[derive(Clone, Debug, Default)]
pub struct CollectionMetadataPatch {
    pub file_id: Option<String>,
    pub document_count: Option<u64>,
    pub modification_token: Option<String>,
}

impl CollectionMetadataPatch {
    fn apply(&self, metadata: &mut CollectionMetadata, now: DateTime<Utc>) {
        if let Some(file_id) = &self.file_id {
            metadata.file_id = file_id.clone();
        }
        if let Some(count) = self.document_count {
            metadata.document_count = count;
        }
        if let Some(token) = &self.modification_token {
            metadata.modification_token = token.clone();
        }
        metadata.last_updated = now;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModificationHistoryEntry {
    pub token: String,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterIndexRecord {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionMetadata>,
    #[serde(default)]
    pub modification_history: BTreeMap<String, VecDeque<ModificationHistoryEntry>>,
}

impl MasterIndexRecord {
    fn empty() -> Self {
        MasterIndexRecord {
            version: 1,
            last_updated: Utc::now(),
            collections: BTreeMap::new(),
            modification_history: BTreeMap::new(),
        }
    }

    fn record_history(&mut self, name: &str, token: &str, operation: &str, now: DateTime<Utc>) {
        let entries = self.modification_history.entry(name.to_owned()).or_default();
        entries.push_back(ModificationHistoryEntry {
            token: token.to_owned(),
            timestamp: now,
            operation: operation.to_owned(),
        });
        while entries.len() > MAX_HISTORY_ENTRIES {
            entries.pop_front();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictStrategy {
    LastWriteWins,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConflictResolution {
    pub success: bool,
    pub data: CollectionMetadata,
}

pub struct MasterIndex<P> {
    bag: P,
    key: String,
    lock_timeout: StdDuration,
    /// Monotonic counter folded into generated operation ids so that two
    /// lock attempts issued in the same microsecond never collide.
    operation_sequence: Cell<u64>,
}

impl<P: PropertyBagClient> MasterIndex<P> {
    pub fn new(bag: P, key: impl Into<String>, lock_timeout: StdDuration) -> Self {
        MasterIndex {
            bag,
            key: key.into(),
            lock_timeout,
            operation_sequence: Cell::new(0),
        }
    }

    /// Generate a per-process-unique operation id (used as the lock owner
    /// tag); combines a fresh UUID with a monotonic sequence number.
    pub fn fresh_operation_id(&self) -> String {
        let seq = self.operation_sequence.get();
        self.operation_sequence.set(seq + 1);
        format!("{}-{seq}", ids::new_id())
    }

    /// Load the current record, creating and persisting an empty one if
    /// the key is absent.
    pub fn initialise(&self) -> DbResult<MasterIndexRecord> {
        match self.bag.get_property(&self.key)? {
            Some(raw) => self.parse(&raw),
            None => {
                let record = MasterIndexRecord::empty();
                self.store(&record)?;
                Ok(record)
            }
        }
    }

    fn parse(&self, raw: &str) -> DbResult<MasterIndexRecord> {
        serde_json::from_str(raw)
            .map_err(|e| DbError::master_index_error(format!("corrupt master index: {e}")))
    }

    fn load(&self) -> DbResult<MasterIndexRecord> {
        match self.bag.get_property(&self.key)? {
            Some(raw) => self.parse(&raw),
            None => Ok(MasterIndexRecord::empty()),
        }
    }

    fn store(&self, record: &MasterIndexRecord) -> DbResult<()> {
        let raw = serde_json::to_string(record)
            .map_err(|e| DbError::master_index_error(format!("failed to serialise master index: {e}")))?;
        self.bag.set_property(&self.key, &raw)
    }

    /// Explicitly persist a record the caller has already loaded and
    /// mutated directly; used by recovery, which rewrites the whole
    /// collections map rather than patching a single entry.
    pub fn save(&self, record: &MasterIndexRecord) -> DbResult<()> {
        self.store(record)
    }

    pub fn add_collection(&self, name: &str, metadata: CollectionMetadata) -> DbResult<()> {
        let mut record = self.load()?;
        if record.collections.contains_key(name) {
            return Err(DbError::invalid_argument(format!(
                "collection already exists: {name}"
            )));
        }
        record.collections.insert(name.to_owned(), metadata);
        record.last_updated = Utc::now();
        self.store(&record)
    }

    pub fn remove_collection(&self, name: &str) -> DbResult<bool> {
        let mut record = self.load()?;
        let removed = record.collections.remove(name).is_some();
        if removed {
            record.modification_history.remove(name);
            record.last_updated = Utc::now();
            self.store(&record)?;
        }
        Ok(removed)
    }

    pub fn get_collection(&self, name: &str) -> DbResult<Option<CollectionMetadata>> {
        Ok(self.load()?.collections.get(name).cloned())
    }

    pub fn get_collections(&self) -> DbResult<BTreeMap<String, CollectionMetadata>> {
        Ok(self.load()?.collections)
    }

    pub fn update_collection_metadata(
        &self,
        name: &str,
        patch: &CollectionMetadataPatch,
        operation: &str,
    ) -> DbResult<CollectionMetadata> {
        let mut record = self.load()?;
        let now = Utc::now();
        let metadata = record
            .collections
            .get_mut(name)
            .ok_or_else(|| DbError::collection_not_found(name))?;
        patch.apply(metadata, now);
        let token = metadata.modification_token.clone();
        let updated = metadata.clone();
        record.record_history(name, &token, operation, now);
        record.last_updated = now;
        self.store(&record)?;
        Ok(updated)
    }

    pub fn generate_modification_token(&self) -> String {
        ids::new_id()
    }

    pub fn validate_modification_token(&self, token: &str) -> DbResult<()> {
        if token.trim().is_empty() {
            return Err(DbError::invalid_argument("modification token must be non-empty"));
        }
        Ok(())
    }

    pub fn has_conflict(&self, name: &str, expected_token: &str) -> DbResult<bool> {
        let metadata = self
            .get_collection(name)?
            .ok_or_else(|| DbError::collection_not_found(name))?;
        Ok(metadata.modification_token != expected_token)
    }

    pub fn resolve_conflict(
        &self,
        name: &str,
        incoming: &CollectionMetadataPatch,
        strategy: ConflictStrategy,
    ) -> DbResult<ConflictResolution> {
        match strategy {
            ConflictStrategy::LastWriteWins => {
                let mut record = self.load()?;
                let now = Utc::now();
                let metadata = record
                    .collections
                    .get_mut(name)
                    .ok_or_else(|| DbError::collection_not_found(name))?;
                incoming.apply(metadata, now);
                metadata.modification_token = ids::new_id();
                let resolved = metadata.clone();
                record.record_history(name, &resolved.modification_token, "resolveConflict", now);
                record.last_updated = now;
                self.store(&record)?;
                Ok(ConflictResolution {
                    success: true,
                    data: resolved,
                })
            }
        }
    }

    pub fn acquire_collection_lock(&self, name: &str, operation_id: &str) -> DbResult<bool> {
        let mut record = self.load()?;
        let now = Utc::now();
        let metadata = record
            .collections
            .get_mut(name)
            .ok_or_else(|| DbError::collection_not_found(name))?;
        if metadata.lock_status.is_locked && !metadata.lock_status.is_expired(now) {
            return Ok(false);
        }
        if metadata.lock_status.is_locked {
            warn!("stealing expired collection lock"; "collection" => name, "previous_owner" => metadata.lock_status.locked_by.clone().unwrap_or_default());
        }
        let timeout = ChronoDuration::from_std(self.lock_timeout).unwrap_or(ChronoDuration::zero());
        metadata.lock_status = LockStatus {
            is_locked: true,
            locked_by: Some(operation_id.to_owned()),
            locked_at: Some(now),
            lock_expires_at: Some(now + timeout),
        };
        self.store(&record)?;
        Ok(true)
    }

    pub fn release_collection_lock(&self, name: &str, operation_id: &str) -> DbResult<bool> {
        let mut record = self.load()?;
        let now = Utc::now();
        let metadata = record
            .collections
            .get_mut(name)
            .ok_or_else(|| DbError::collection_not_found(name))?;
        let lock = &metadata.lock_status;
        if !lock.is_locked {
            return Ok(false);
        }
        let owns = lock.locked_by.as_deref() == Some(operation_id);
        let stale = lock.is_expired(now);
        if !owns && !stale {
            return Ok(false);
        }
        metadata.lock_status = LockStatus::unlocked();
        self.store(&record)?;
        Ok(true)
    }

    pub fn is_collection_locked(&self, name: &str) -> DbResult<bool> {
        let metadata = self
            .get_collection(name)?
            .ok_or_else(|| DbError::collection_not_found(name))?;
        let now = Utc::now();
        Ok(metadata.lock_status.is_locked && !metadata.lock_status.is_expired(now))
    }

    pub fn cleanup_expired_locks(&self) -> DbResult<bool> {
        let mut record = self.load()?;
        let now = Utc::now();
        let mut any_cleared = false;
        for metadata in record.collections.values_mut() {
            if metadata.lock_status.is_locked && metadata.lock_status.is_expired(now) {
                metadata.lock_status = LockStatus::unlocked();
                any_cleared = true;
            }
        }
        if any_cleared {
            self.store(&record)?;
        }
        Ok(any_cleared)
    }

    pub fn get_modification_history(&self, name: &str) -> DbResult<VecDeque<ModificationHistoryEntry>> {
        Ok(self
            .load()?
            .modification_history
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}
