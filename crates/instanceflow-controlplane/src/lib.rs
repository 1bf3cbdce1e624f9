//! InstanceFlow Control Plane
//!
//! Keeps declaratively-described compute instances in sync with a cloud
//! provider: provisions an instance for each new record, records its network
//! identity once running, and terminates it before the record goes away.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  watch / resync / requeue  ┌──────────────┐
//! │ RecordStore  │ ─────────────────────────▶ │  Controller  │
//! │ (memory/file)│ ◀───── status writes ──┐   └──────┬───────┘
//! └──────────────┘                        │          │ one pass per key
//!                                         │   ┌──────▼───────┐
//!                                         └── │  Reconciler  │
//!                                             └──┬────────┬──┘
//!                                   ┌────────────▼─┐  ┌───▼────────────┐
//!                                   │ Provisioner  │  │  Terminator    │
//!                                   └────────────┬─┘  └───┬────────────┘
//!                                                ▼        ▼
//!                                           dyn CloudClient
//! ```

pub mod clock;
pub mod controller;
pub mod error;
pub mod file_store;
pub mod model;
pub mod provisioner;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod terminator;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use controller::{Controller, ControllerConfig};
pub use error::{ControllerError, Result};
pub use file_store::FileStore;
pub use model::{
    CreatedInstanceInfo, DesiredInstanceSpec, FINALIZER, InstanceRecord, LifecycleState,
    ObjectMeta, ObservedInstanceStatus, RecordKey, StorageSpec, VolumeSpec,
};
pub use provisioner::{InstanceProvisioner, Observation, PROVISION_TIMEOUT};
pub use reconciler::{Action, MAX_CONFLICT_RETRIES, Reconciler};
pub use store::{ChangeKind, MemoryStore, RecordStore, StoreEvent, WriteOutcome};
pub use terminator::{InstanceTerminator, TERMINATE_TIMEOUT, TerminationProgress};
