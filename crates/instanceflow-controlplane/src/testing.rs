//! Test fixtures (feature `test-utils`)

use crate::error::{ControllerError, Result};
use crate::model::{DesiredInstanceSpec, InstanceRecord, RecordKey};
use crate::store::{RecordStore, StoreEvent, WriteOutcome};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;

/// `ami-1` / `t2.micro` in `us-east-1`, subnet `subnet-1`
pub fn sample_spec() -> DesiredInstanceSpec {
    let mut spec = DesiredInstanceSpec::new("ami-1", "t2.micro", "us-east-1");
    spec.subnet = Some("subnet-1".to_string());
    spec
}

pub fn sample_record(name: &str) -> InstanceRecord {
    InstanceRecord::new(&RecordKey::named(name), sample_spec())
}

/// Store wrapper that injects write failures
pub struct FlakyStore<S> {
    inner: S,
    status_passes: AtomicU32,
    status_failures: AtomicU32,
    conflicts: AtomicU32,
}

impl<S: RecordStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            status_passes: AtomicU32::new(0),
            status_failures: AtomicU32::new(0),
            conflicts: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` status writes with an I/O error
    pub fn fail_status_writes(&self, count: u32) {
        self.status_failures.store(count, Ordering::SeqCst);
    }

    /// Let `passing` status writes through, then fail the `count` after them
    pub fn fail_status_writes_after(&self, passing: u32, count: u32) {
        self.status_passes.store(passing, Ordering::SeqCst);
        self.status_failures.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` writes of any kind as stale
    pub fn conflict_writes(&self, count: u32) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_conflict(&self, record: &InstanceRecord) -> Result<()> {
        if Self::take(&self.conflicts) {
            return Err(ControllerError::PersistConflict(record.key()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for FlakyStore<S> {
    async fn get(&self, key: &RecordKey) -> Result<Option<InstanceRecord>> {
        self.inner.get(key).await
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>> {
        self.inner.list().await
    }

    async fn create(&self, record: InstanceRecord) -> Result<InstanceRecord> {
        self.inner.create(record).await
    }

    async fn update(&self, record: &InstanceRecord) -> Result<WriteOutcome> {
        self.check_conflict(record)?;
        self.inner.update(record).await
    }

    async fn update_status(&self, record: &InstanceRecord) -> Result<InstanceRecord> {
        self.check_conflict(record)?;
        if !Self::take(&self.status_passes) && Self::take(&self.status_failures) {
            return Err(ControllerError::Io(std::io::Error::other(
                "injected status write failure",
            )));
        }
        self.inner.update_status(record).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<WriteOutcome> {
        self.inner.delete(key).await
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.watch()
    }
}
