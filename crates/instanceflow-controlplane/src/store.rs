//! Record store
//!
//! Stores declarative records with optimistic concurrency: every write must
//! carry the `resource_version` it was based on. A record with a deletion
//! marker is physically removed only once no finalizers remain.

use crate::error::{ControllerError, Result};
use crate::model::{InstanceRecord, RecordKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Result of a write that may remove the record
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The record was stored (possibly unchanged)
    Stored(InstanceRecord),
    /// Deletion was requested and no finalizers remained
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    /// Metadata (finalizers, labels) changed
    Updated,
    StatusUpdated,
    DeletionRequested,
    Removed,
}

/// Change notification broadcast by a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: RecordKey,
    pub change: ChangeKind,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<InstanceRecord>>;

    async fn list(&self) -> Result<Vec<InstanceRecord>>;

    async fn list_keys(&self) -> Result<Vec<RecordKey>> {
        Ok(self.list().await?.iter().map(InstanceRecord::key).collect())
    }

    /// Insert a new record, assigning uid, resource version and creation timestamp
    async fn create(&self, record: InstanceRecord) -> Result<InstanceRecord>;

    /// Write metadata (finalizers, labels). Status is left untouched.
    async fn update(&self, record: &InstanceRecord) -> Result<WriteOutcome>;

    /// Write status only
    async fn update_status(&self, record: &InstanceRecord) -> Result<InstanceRecord>;

    /// Request deletion: immediate when no finalizers remain, otherwise sets the deletion marker
    async fn delete(&self, key: &RecordKey) -> Result<WriteOutcome>;

    /// Subscribe to changes made through this store
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Store semantics over an in-memory map, shared by every `RecordStore` backend
#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    records: BTreeMap<RecordKey, InstanceRecord>,
}

impl StoreState {
    pub(crate) fn from_records(records: Vec<InstanceRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.key(), r)).collect(),
        }
    }

    pub(crate) fn records(&self) -> Vec<InstanceRecord> {
        self.records.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn get(&self, key: &RecordKey) -> Option<InstanceRecord> {
        self.records.get(key).cloned()
    }

    pub(crate) fn create(
        &mut self,
        mut record: InstanceRecord,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord> {
        let key = record.key();
        record
            .spec
            .validate()
            .map_err(|reason| ControllerError::InvalidSpec {
                key: key.clone(),
                reason,
            })?;
        if self.records.contains_key(&key) {
            return Err(ControllerError::AlreadyExists(key));
        }

        record.metadata.uid = Uuid::new_v4();
        record.metadata.resource_version = 1;
        record.metadata.creation_timestamp = Some(now);
        record.metadata.deletion_timestamp = None;
        record.status = Default::default();

        self.records.insert(key, record.clone());
        Ok(record)
    }

    fn current_for_write(&self, record: &InstanceRecord) -> Result<&InstanceRecord> {
        let key = record.key();
        let current = self
            .records
            .get(&key)
            .ok_or_else(|| ControllerError::RecordNotFound(key.clone()))?;
        if current.metadata.resource_version != record.metadata.resource_version {
            return Err(ControllerError::PersistConflict(key));
        }
        if current.spec != record.spec {
            return Err(ControllerError::ImmutableSpec(key));
        }
        Ok(current)
    }

    pub(crate) fn update(&mut self, record: &InstanceRecord) -> Result<WriteOutcome> {
        let mut next = self.current_for_write(record)?.clone();
        next.metadata.finalizers = record.metadata.finalizers.clone();
        next.metadata.labels = record.metadata.labels.clone();
        next.metadata.resource_version += 1;
        Ok(self.store_or_remove(next))
    }

    pub(crate) fn update_status(&mut self, record: &InstanceRecord) -> Result<InstanceRecord> {
        let mut next = self.current_for_write(record)?.clone();
        next.status = record.status.clone();
        next.metadata.resource_version += 1;
        self.records.insert(next.key(), next.clone());
        Ok(next)
    }

    pub(crate) fn delete(&mut self, key: &RecordKey, now: DateTime<Utc>) -> Result<WriteOutcome> {
        let current = self
            .records
            .get(key)
            .ok_or_else(|| ControllerError::RecordNotFound(key.clone()))?;
        if current.metadata.is_deleting() {
            return Ok(WriteOutcome::Stored(current.clone()));
        }

        let mut next = current.clone();
        next.metadata.deletion_timestamp = Some(now);
        next.metadata.resource_version += 1;
        Ok(self.store_or_remove(next))
    }

    fn store_or_remove(&mut self, record: InstanceRecord) -> WriteOutcome {
        let key = record.key();
        if record.metadata.is_deleting() && record.metadata.finalizers.is_empty() {
            self.records.remove(&key);
            WriteOutcome::Removed
        } else {
            self.records.insert(key, record.clone());
            WriteOutcome::Stored(record)
        }
    }
}

pub(crate) fn change_for(outcome: &WriteOutcome, stored: ChangeKind) -> ChangeKind {
    match outcome {
        WriteOutcome::Stored(_) => stored,
        WriteOutcome::Removed => ChangeKind::Removed,
    }
}

/// In-process store; used by tests and single-process setups
pub struct MemoryStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(StoreState::default()),
            events,
        }
    }

    fn notify(&self, key: RecordKey, change: ChangeKind) {
        // No subscribers is fine.
        let _ = self.events.send(StoreEvent { key, change });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<InstanceRecord>> {
        Ok(self.state.lock().await.get(key))
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self.state.lock().await.records())
    }

    async fn create(&self, record: InstanceRecord) -> Result<InstanceRecord> {
        let created = self.state.lock().await.create(record, Utc::now())?;
        self.notify(created.key(), ChangeKind::Created);
        Ok(created)
    }

    async fn update(&self, record: &InstanceRecord) -> Result<WriteOutcome> {
        let outcome = self.state.lock().await.update(record)?;
        self.notify(record.key(), change_for(&outcome, ChangeKind::Updated));
        Ok(outcome)
    }

    async fn update_status(&self, record: &InstanceRecord) -> Result<InstanceRecord> {
        let stored = self.state.lock().await.update_status(record)?;
        self.notify(stored.key(), ChangeKind::StatusUpdated);
        Ok(stored)
    }

    async fn delete(&self, key: &RecordKey) -> Result<WriteOutcome> {
        let outcome = self.state.lock().await.delete(key, Utc::now())?;
        self.notify(key.clone(), change_for(&outcome, ChangeKind::DeletionRequested));
        Ok(outcome)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
