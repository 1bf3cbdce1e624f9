//! Control plane error types

use crate::model::RecordKey;
use chrono::{DateTime, Utc};
use instanceflow_cloud::{CloudError, InstanceState};
use std::time::Duration;
use thiserror::Error;

/// Errors of one reconciliation pass or store operation, always scoped to one record
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The create/describe/terminate call itself failed
    #[error("Provider call failed: {0}")]
    ProviderCall(#[from] CloudError),

    /// The provider answered successfully but reported no instance
    #[error("{operation} returned no instances")]
    EmptyResult { operation: &'static str },

    /// The instance did not reach the target state within the wait window
    #[error("Instance {instance_id} did not become {target} within {}s", timeout.as_secs())]
    WaitTimeout {
        instance_id: String,
        target: InstanceState,
        timeout: Duration,
    },

    /// Optimistic-concurrency check failed (stale resource version)
    #[error("Record {0} was modified concurrently")]
    PersistConflict(RecordKey),

    #[error("Instance {instance_id} is {actual} while waiting for it to become {expected}")]
    UnexpectedState {
        instance_id: String,
        actual: InstanceState,
        expected: InstanceState,
    },

    /// A launched instance vanished before it reached `running`
    #[error("Instance {instance_id} disappeared before it was running")]
    InstanceMissing { instance_id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Record not found: {0}")]
    RecordNotFound(RecordKey),

    #[error("Record already exists: {0}")]
    AlreadyExists(RecordKey),

    #[error("Spec of {0} cannot be changed after creation")]
    ImmutableSpec(RecordKey),

    #[error("Invalid spec for {key}: {reason}")]
    InvalidSpec { key: RecordKey, reason: String },

    #[error("Record store is locked by {holder} since {since}")]
    StoreLocked {
        holder: String,
        since: DateTime<Utc>,
    },

    #[error("Record store version {found} is newer than supported version {supported}")]
    StoreVersion { found: u32, supported: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
