//! File-backed record store
//!
//! Manages `<state_dir>/records.json` so the daemon and one-shot CLI
//! invocations can share records. Every operation takes the lock file,
//! loads, applies the change and saves (keeping one backup).
//!
//! Watch events are raised by this process's own writes. Writes made by
//! other processes surface through `poll_external_changes`, which the
//! daemon calls on an interval.

use crate::error::{ControllerError, Result};
use crate::model::{InstanceRecord, RecordKey};
use crate::store::{ChangeKind, RecordStore, StoreEvent, StoreState, WriteOutcome, change_for};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, broadcast};

const STORE_VERSION: u32 = 1;
const RECORDS_FILE: &str = "records.json";
const RECORDS_BACKUP: &str = "records.json.backup";
const LOCK_FILE: &str = "lock.json";

const EVENT_CAPACITY: usize = 256;
const LOCK_ATTEMPTS: u32 = 20;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// On-disk layout of `records.json`
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    updated_at: DateTime<Utc>,
    records: Vec<InstanceRecord>,
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for the lock file
struct StoreLock {
    lock_path: PathBuf,
    released: bool,
}

impl StoreLock {
    async fn release(mut self) -> Result<()> {
        if !self.released {
            match fs::remove_file(&self.lock_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

pub struct FileStore {
    state_dir: PathBuf,
    /// Serializes operations within this process; the lock file handles other processes.
    guard: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
    /// Resource version of each record as this process last saw it
    seen: Mutex<HashMap<RecordKey, u64>>,
}

impl FileStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            guard: Mutex::new(()),
            events,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn records_path(&self) -> PathBuf {
        self.state_dir.join(RECORDS_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.state_dir.join(RECORDS_BACKUP)
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    async fn ensure_state_dir(&self) -> Result<()> {
        if !self.state_dir.exists() {
            fs::create_dir_all(&self.state_dir).await?;
            tracing::debug!("Created state directory: {}", self.state_dir.display());
        }
        Ok(())
    }

    async fn load(&self) -> Result<StoreState> {
        let path = self.records_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("Records file not found, starting empty");
                return Ok(StoreState::default());
            }
            Err(e) => return Err(e.into()),
        };

        let file: StoreFile = serde_json::from_str(&content)?;
        if file.version > STORE_VERSION {
            return Err(ControllerError::StoreVersion {
                found: file.version,
                supported: STORE_VERSION,
            });
        }
        Ok(StoreState::from_records(file.records))
    }

    async fn save(&self, state: &StoreState) -> Result<()> {
        let path = self.records_path();
        let backup = self.backup_path();
        let staging = self.state_dir.join(format!("{}.tmp", RECORDS_FILE));

        let file = StoreFile {
            version: STORE_VERSION,
            updated_at: Utc::now(),
            records: state.records(),
        };
        fs::write(&staging, serde_json::to_string_pretty(&file)?).await?;

        if path.exists() {
            fs::copy(&path, &backup).await?;
        }
        fs::rename(&staging, &path).await?;

        tracing::debug!(records = state.len(), "Saved records");
        Ok(())
    }

    async fn acquire_lock(&self) -> Result<StoreLock> {
        self.ensure_state_dir().await?;
        let lock_path = self.lock_path();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let lock_info = LockInfo {
                holder: std::env::var("HOSTNAME")
                    .or_else(|_| std::env::var("HOST"))
                    .unwrap_or_else(|_| "unknown".to_string()),
                pid: std::process::id(),
                acquired_at: Utc::now(),
            };
            let content = serde_json::to_vec_pretty(&lock_info)?;

            match create_exclusive(&lock_path, &content).await {
                Ok(()) => {
                    return Ok(StoreLock {
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            // Held by someone else: break it if stale, otherwise wait.
            let existing = match fs::read_to_string(&lock_path).await {
                Ok(content) => serde_json::from_str::<LockInfo>(&content).ok(),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let Some(existing) = existing else {
                // Partially written by a concurrent holder
                if attempt >= LOCK_ATTEMPTS {
                    return Err(ControllerError::StoreLocked {
                        holder: "unknown".to_string(),
                        since: Utc::now(),
                    });
                }
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
                continue;
            };

            let age = Utc::now().signed_duration_since(existing.acquired_at);
            if age.num_hours() >= 1 {
                tracing::warn!("Removing stale lock from {}", existing.holder);
                let _ = fs::remove_file(&lock_path).await;
                continue;
            }

            if attempt >= LOCK_ATTEMPTS {
                return Err(ControllerError::StoreLocked {
                    holder: format!("{} (pid {})", existing.holder, existing.pid),
                    since: existing.acquired_at,
                });
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
    }

    /// Run `apply` against the current contents under the lock, saving if it succeeds
    async fn transact<T>(
        &self,
        persist: bool,
        apply: impl FnOnce(&mut StoreState) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.guard.lock().await;
        let lock = self.acquire_lock().await?;

        let mut state = self.load().await?;
        let result = apply(&mut state);
        if persist && result.is_ok() {
            self.save(&state).await?;
        }

        lock.release().await?;
        result
    }

    fn notify(&self, key: RecordKey, change: ChangeKind) {
        let _ = self.events.send(StoreEvent { key, change });
    }

    /// Track this process's own write so polling does not report it again
    async fn remember(&self, key: RecordKey, version: Option<u64>) {
        let mut seen = self.seen.lock().await;
        match version {
            Some(version) => seen.insert(key, version),
            None => seen.remove(&key),
        };
    }

    async fn remember_outcome(&self, key: RecordKey, outcome: &WriteOutcome) {
        let version = match outcome {
            WriteOutcome::Stored(stored) => Some(stored.metadata.resource_version),
            WriteOutcome::Removed => None,
        };
        self.remember(key, version).await;
    }

    /// Broadcast records created, changed or removed since the last look,
    /// returning how many events were sent
    ///
    /// The first call reports every record as created.
    pub async fn poll_external_changes(&self) -> Result<usize> {
        let records = self.list().await?;
        let mut seen = self.seen.lock().await;

        let mut current = HashMap::with_capacity(records.len());
        let mut sent = 0;
        for record in records {
            let key = record.key();
            let version = record.metadata.resource_version;
            let change = match seen.get(&key) {
                Some(previous) if *previous == version => None,
                None => Some(ChangeKind::Created),
                Some(_) if record.metadata.is_deleting() => Some(ChangeKind::DeletionRequested),
                Some(_) => Some(ChangeKind::Updated),
            };
            if let Some(change) = change {
                tracing::debug!(key = %key, ?change, "external change");
                self.notify(key.clone(), change);
                sent += 1;
            }
            current.insert(key, version);
        }
        for key in seen.keys().filter(|key| !current.contains_key(*key)) {
            tracing::debug!(key = %key, "external removal");
            self.notify(key.clone(), ChangeKind::Removed);
            sent += 1;
        }

        *seen = current;
        Ok(sent)
    }
}

async fn create_exclusive(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(content).await?;
    file.flush().await
}

#[async_trait]
impl RecordStore for FileStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<InstanceRecord>> {
        self.transact(false, |state| Ok(state.get(key))).await
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>> {
        self.transact(false, |state| Ok(state.records())).await
    }

    async fn create(&self, record: InstanceRecord) -> Result<InstanceRecord> {
        let created = self
            .transact(true, |state| state.create(record, Utc::now()))
            .await?;
        self.remember(created.key(), Some(created.metadata.resource_version))
            .await;
        self.notify(created.key(), ChangeKind::Created);
        Ok(created)
    }

    async fn update(&self, record: &InstanceRecord) -> Result<WriteOutcome> {
        let outcome = self.transact(true, |state| state.update(record)).await?;
        self.remember_outcome(record.key(), &outcome).await;
        self.notify(record.key(), change_for(&outcome, ChangeKind::Updated));
        Ok(outcome)
    }

    async fn update_status(&self, record: &InstanceRecord) -> Result<InstanceRecord> {
        let stored = self
            .transact(true, |state| state.update_status(record))
            .await?;
        self.remember(stored.key(), Some(stored.metadata.resource_version))
            .await;
        self.notify(stored.key(), ChangeKind::StatusUpdated);
        Ok(stored)
    }

    async fn delete(&self, key: &RecordKey) -> Result<WriteOutcome> {
        let outcome = self
            .transact(true, |state| state.delete(key, Utc::now()))
            .await?;
        self.remember_outcome(key.clone(), &outcome).await;
        self.notify(key.clone(), change_for(&outcome, ChangeKind::DeletionRequested));
        Ok(outcome)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
