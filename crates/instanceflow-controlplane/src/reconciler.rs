//! Reconciliation state machine
//!
//! One pass reads a record, compares it with the provider, takes at most one
//! lifecycle step and persists the outcome. Waits for an instance to start
//! or stop never block a pass: the window is persisted as `waitDeadline`,
//! the next poll as `nextCheckAfter`, and the pass asks to be requeued.
//!
//! ```text
//!  unprovisioned ──launch──▶ provisioning ──observe: running──▶ running
//!                                 │                               │
//!                                 └──────── deletion marker ──────┤
//!                                                                 ▼
//!                      (record removed) ◀──confirm── terminating
//! ```

use crate::clock::Clock;
use crate::error::{ControllerError, Result};
use crate::model::{
    FINALIZER, InstanceRecord, LifecycleState, ObjectMeta, ObservedInstanceStatus, RecordKey,
};
use crate::provisioner::{InstanceProvisioner, Observation, PROVISION_TIMEOUT};
use crate::store::{RecordStore, WriteOutcome};
use crate::terminator::{InstanceTerminator, TERMINATE_TIMEOUT, TerminationProgress};
use chrono::{DateTime, Utc};
use instanceflow_cloud::{CloudClient, InstanceState};
use std::sync::Arc;
use std::time::Duration;

/// Attempts for a write that keeps hitting stale resource versions
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// What the controller should do with a key after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing scheduled; wait for the next change or resync
    AwaitChange,
    Requeue(Duration),
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    provisioner: InstanceProvisioner,
    terminator: InstanceTerminator,
    poll_interval: Duration,
    clock: Clock,
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Time left until `at`, if it lies in the future
fn remaining(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    at.and_then(|at| (at - now).to_std().ok())
        .filter(|left| !left.is_zero())
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        client: Arc<dyn CloudClient>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            provisioner: InstanceProvisioner::new(client.clone(), poll_interval),
            terminator: InstanceTerminator::new(client, poll_interval),
            poll_interval,
            clock: Clock::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Run one reconciliation pass for `key`
    pub async fn reconcile(&self, key: &RecordKey) -> Result<Action> {
        let Some(record) = self.store.get(key).await? else {
            tracing::debug!(key = %key, "record gone, nothing to do");
            return Ok(Action::AwaitChange);
        };

        if record.metadata.is_deleting() {
            return self.reconcile_deletion(record).await;
        }

        match record.status.instance_id.clone() {
            None => self.create_instance(record).await,
            Some(instance_id) => match record.status.state {
                LifecycleState::Unprovisioned | LifecycleState::Provisioning => {
                    self.observe_launch(record, instance_id).await
                }
                // Drift detection is not implemented; a live instance is left alone.
                _ => Ok(Action::AwaitChange),
            },
        }
    }

    /// Persist a failed pass's message on the record (best effort)
    pub async fn record_error(&self, key: &RecordKey, error: &ControllerError) {
        let message = error.to_string();
        let record = match self.store.get(key).await {
            Ok(Some(record)) => record,
            _ => return,
        };
        if record.status.last_error.as_deref() == Some(message.as_str()) {
            return;
        }
        if let Err(e) = self
            .write_status(record, |status| status.last_error = Some(message.clone()))
            .await
        {
            tracing::debug!(key = %key, error = %e, "could not record last error");
        }
    }

    async fn create_instance(&self, record: InstanceRecord) -> Result<Action> {
        let key = record.key();

        // The finalizer must be durable before anything exists at the provider.
        let record = if record.metadata.has_finalizer(FINALIZER) {
            record
        } else {
            match self
                .write_metadata(record, |meta| {
                    meta.add_finalizer(FINALIZER);
                })
                .await?
            {
                Some(record) => record,
                None => return Ok(Action::AwaitChange),
            }
        };

        // Marks that a launch may be in flight, so deletion looks the
        // instance up by client token even if its id never got recorded.
        let record = if record.status.state == LifecycleState::Provisioning {
            record
        } else {
            self.write_status(record, |status| {
                status.state = LifecycleState::Provisioning;
                status.clear_wait();
            })
            .await?
        };

        let instance_id = self
            .provisioner
            .launch(&record.spec, Some(&record.client_token()))
            .await?;

        let deadline = self.clock.now() + chrono_duration(PROVISION_TIMEOUT);
        let launched_id = instance_id.clone();
        let record = self
            .write_status(record, move |status| {
                status.state = LifecycleState::Provisioning;
                status.instance_id = Some(launched_id.clone());
                status.public_ip = None;
                status.private_ip = None;
                status.public_dns = None;
                status.private_dns = None;
                status.wait_deadline = Some(deadline);
                status.next_check_after = None;
                status.last_error = None;
            })
            .await?;
        tracing::info!(key = %key, instance_id = %instance_id, "provisioning");

        self.observe_launch(record, instance_id).await
    }

    async fn observe_launch(&self, record: InstanceRecord, instance_id: String) -> Result<Action> {
        let key = record.key();
        let now = self.clock.now();
        if let Some(left) = remaining(record.status.next_check_after, now) {
            return Ok(Action::Requeue(left));
        }

        let observation = self
            .provisioner
            .observe(&record.spec.region, &instance_id)
            .await?;
        let missing = observation == Observation::Missing;

        match observation {
            Observation::Running(info) => {
                self.write_status(record, |status| {
                    status.state = LifecycleState::Running;
                    status.apply_instance(&info);
                    status.clear_wait();
                    status.last_error = None;
                })
                .await?;
                tracing::info!(
                    key = %key,
                    instance_id = %info.instance_id,
                    public_ip = info.public_ip.as_deref().unwrap_or("-"),
                    private_ip = info.private_ip.as_deref().unwrap_or("-"),
                    "instance running"
                );
                Ok(Action::AwaitChange)
            }
            Observation::Pending(_) | Observation::Missing => {
                let deadline = record.status.wait_deadline;
                let expired = deadline.is_some_and(|deadline| now >= deadline);
                if expired && missing {
                    // Start over under a fresh client token; the old one
                    // would replay the vanished instance.
                    self.write_status(record, |status| {
                        status.state = LifecycleState::Unprovisioned;
                        status.instance_id = None;
                        status.public_ip = None;
                        status.private_ip = None;
                        status.public_dns = None;
                        status.private_dns = None;
                        status.clear_wait();
                        status.launch_generation += 1;
                    })
                    .await?;
                    return Err(ControllerError::InstanceMissing { instance_id });
                }
                if expired {
                    self.write_status(record, ObservedInstanceStatus::clear_wait)
                        .await?;
                    return Err(ControllerError::WaitTimeout {
                        instance_id,
                        target: InstanceState::Running,
                        timeout: PROVISION_TIMEOUT,
                    });
                }

                tracing::debug!(key = %key, instance_id = %instance_id, missing, "instance not running yet");
                let new_deadline = deadline.unwrap_or(now + chrono_duration(PROVISION_TIMEOUT));
                let next_check = now + chrono_duration(self.poll_interval);
                self.write_status(record, move |status| {
                    status.state = LifecycleState::Provisioning;
                    status.wait_deadline = Some(new_deadline);
                    status.next_check_after = Some(next_check);
                })
                .await?;
                Ok(Action::Requeue(self.poll_interval))
            }
        }
    }

    async fn reconcile_deletion(&self, record: InstanceRecord) -> Result<Action> {
        let key = record.key();
        if !record.metadata.has_finalizer(FINALIZER) {
            return Ok(Action::AwaitChange);
        }

        let (record, instance_id) = match record.status.instance_id.clone() {
            Some(instance_id) => (record, instance_id),
            None => match self.find_unrecorded_launch(&record).await? {
                Some(instance_id) => {
                    tracing::warn!(key = %key, instance_id = %instance_id, "found launched instance missing from status");
                    let recovered = instance_id.clone();
                    let record = self
                        .write_status(record, move |status| {
                            status.instance_id = Some(recovered.clone());
                        })
                        .await?;
                    (record, instance_id)
                }
                None => {
                    tracing::info!(key = %key, "no instance was launched, releasing record");
                    self.release(record).await?;
                    return Ok(Action::AwaitChange);
                }
            },
        };
        if record.status.state == LifecycleState::Terminated {
            self.release(record).await?;
            return Ok(Action::AwaitChange);
        }

        let region = record.spec.region.clone();
        let now = self.clock.now();

        let record = if record.status.state != LifecycleState::Terminating
            || record.status.wait_deadline.is_none()
        {
            let current = self
                .terminator
                .request_termination(&region, &instance_id)
                .await?;
            if current == InstanceState::Terminated {
                return self.finish_termination(record, &instance_id).await;
            }

            let deadline = now + chrono_duration(TERMINATE_TIMEOUT);
            self.write_status(record, move |status| {
                status.state = LifecycleState::Terminating;
                status.wait_deadline = Some(deadline);
                status.next_check_after = None;
                status.last_error = None;
            })
            .await?
        } else if let Some(left) = remaining(record.status.next_check_after, now) {
            return Ok(Action::Requeue(left));
        } else {
            record
        };

        match self
            .terminator
            .confirm_termination(&region, &instance_id)
            .await?
        {
            TerminationProgress::Terminated => {
                self.finish_termination(record, &instance_id).await
            }
            TerminationProgress::InProgress(state) => {
                if record.status.wait_deadline.is_some_and(|deadline| now >= deadline) {
                    // Next pass re-issues the terminate call and opens a new window.
                    self.write_status(record, ObservedInstanceStatus::clear_wait)
                        .await?;
                    return Err(ControllerError::WaitTimeout {
                        instance_id,
                        target: InstanceState::Terminated,
                        timeout: TERMINATE_TIMEOUT,
                    });
                }

                tracing::debug!(key = %key, instance_id = %instance_id, state = %state, "termination in progress");
                let next_check = now + chrono_duration(self.poll_interval);
                self.write_status(record, move |status| {
                    status.next_check_after = Some(next_check);
                })
                .await?;
                Ok(Action::Requeue(self.poll_interval))
            }
        }
    }

    /// A launch that may have succeeded without its id being persisted
    async fn find_unrecorded_launch(&self, record: &InstanceRecord) -> Result<Option<String>> {
        if record.status.state != LifecycleState::Provisioning {
            return Ok(None);
        }
        self.provisioner
            .find_launched(&record.spec.region, &record.client_token())
            .await
    }

    async fn finish_termination(&self, record: InstanceRecord, instance_id: &str) -> Result<Action> {
        let key = record.key();
        let record = self
            .write_status(record, |status| {
                status.state = LifecycleState::Terminated;
                status.clear_wait();
                status.last_error = None;
            })
            .await?;
        tracing::info!(key = %key, instance_id = %instance_id, "instance terminated");

        self.release(record).await?;
        Ok(Action::AwaitChange)
    }

    /// Drop the finalizer; the store removes the deleting record once none remain
    async fn release(&self, record: InstanceRecord) -> Result<()> {
        let key = record.key();
        if self
            .write_metadata(record, |meta| {
                meta.remove_finalizer(FINALIZER);
            })
            .await?
            .is_none()
        {
            tracing::info!(key = %key, "record removed");
        }
        Ok(())
    }

    /// Write status, re-reading and re-applying `mutate` on a stale resource version
    async fn write_status<F>(&self, mut record: InstanceRecord, mutate: F) -> Result<InstanceRecord>
    where
        F: Fn(&mut ObservedInstanceStatus) + Send,
    {
        let key = record.key();
        let mut attempt = 0;
        loop {
            attempt += 1;
            mutate(&mut record.status);
            match self.store.update_status(&record).await {
                Ok(stored) => return Ok(stored),
                Err(ControllerError::PersistConflict(_)) if attempt < MAX_CONFLICT_RETRIES => {
                    tracing::debug!(key = %key, attempt, "status write conflicted, re-reading");
                    record = self.reread(&key).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write metadata with the same conflict handling. `None` means the store removed the record.
    async fn write_metadata<F>(&self, mut record: InstanceRecord, mutate: F) -> Result<Option<InstanceRecord>>
    where
        F: Fn(&mut ObjectMeta) + Send,
    {
        let key = record.key();
        let mut attempt = 0;
        loop {
            attempt += 1;
            mutate(&mut record.metadata);
            match self.store.update(&record).await {
                Ok(WriteOutcome::Stored(stored)) => return Ok(Some(stored)),
                Ok(WriteOutcome::Removed) => return Ok(None),
                Err(ControllerError::PersistConflict(_)) if attempt < MAX_CONFLICT_RETRIES => {
                    tracing::debug!(key = %key, attempt, "metadata write conflicted, re-reading");
                    record = self.reread(&key).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reread(&self, key: &RecordKey) -> Result<InstanceRecord> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| ControllerError::RecordNotFound(key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{FlakyStore, sample_record};
    use instanceflow_cloud::FakeCloud;

    const POLL: Duration = Duration::from_secs(5);

    struct Harness {
        store: Arc<FlakyStore<MemoryStore>>,
        cloud: Arc<FakeCloud>,
        reconciler: Reconciler,
    }

    impl Harness {
        fn new(cloud: FakeCloud) -> Self {
            let store = Arc::new(FlakyStore::new(MemoryStore::new()));
            let cloud = Arc::new(cloud);
            let reconciler = Reconciler::new(store.clone(), cloud.clone(), POLL);
            Self {
                store,
                cloud,
                reconciler,
            }
        }

        async fn create(&self, name: &str) -> RecordKey {
            self.store.create(sample_record(name)).await.unwrap().key()
        }

        async fn record(&self, key: &RecordKey) -> Option<InstanceRecord> {
            self.store.get(key).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_fresh_record_reaches_running_in_one_pass() {
        let h = Harness::new(FakeCloud::new());
        let key = h.create("web").await;

        let action = h.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::AwaitChange);

        let record = h.record(&key).await.unwrap();
        assert_eq!(record.status.state, LifecycleState::Running);
        assert_eq!(record.status.instance_id.as_deref(), Some("i-mock123456"));
        assert_eq!(record.status.public_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(record.status.private_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(record.status.wait_deadline, None);
        assert!(record.metadata.has_finalizer(FINALIZER));
        assert_eq!(h.cloud.launched(), 1);
    }

    #[tokio::test]
    async fn test_running_record_makes_no_provider_calls() {
        let h = Harness::new(FakeCloud::new());
        let key = h.create("web").await;
        h.reconciler.reconcile(&key).await.unwrap();
        let calls = h.cloud.calls();

        assert_eq!(h.reconciler.reconcile(&key).await.unwrap(), Action::AwaitChange);
        assert_eq!(h.cloud.calls(), calls);
        assert_eq!(h.cloud.launched(), 1);
    }

    #[tokio::test]
    async fn test_missing_record_is_ignored() {
        let h = Harness::new(FakeCloud::new());
        let action = h.reconciler.reconcile(&RecordKey::named("ghost")).await.unwrap();
        assert_eq!(action, Action::AwaitChange);
        assert_eq!(h.cloud.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_pending_instance_requeues() {
        let h = Harness::new(
            FakeCloud::new().with_boot_sequence([InstanceState::Pending, InstanceState::Running]),
        );
        let key = h.create("web").await;

        assert_eq!(h.reconciler.reconcile(&key).await.unwrap(), Action::Requeue(POLL));
        let record = h.record(&key).await.unwrap();
        assert_eq!(record.status.state, LifecycleState::Provisioning);
        assert!(record.status.wait_deadline.is_some());
        assert!(record.status.next_check_after.is_some());

        // An early trigger honors nextCheckAfter without calling the provider.
        let calls = h.cloud.calls();
        assert!(matches!(
            h.reconciler.reconcile(&key).await.unwrap(),
            Action::Requeue(_)
        ));
        assert_eq!(h.cloud.calls(), calls);
    }

    #[tokio::test]
    async fn test_provisioning_completes_on_later_pass() {
        let h = Harness::new(
            FakeCloud::new().with_boot_sequence([InstanceState::Pending, InstanceState::Running]),
        );
        let key = h.create("web").await;
        h.reconciler.reconcile(&key).await.unwrap();

        let mut record = h.record(&key).await.unwrap();
        record.status.next_check_after = Some(Utc::now() - chrono::Duration::seconds(1));
        h.store.update_status(&record).await.unwrap();

        assert_eq!(h.reconciler.reconcile(&key).await.unwrap(), Action::AwaitChange);
        let record = h.record(&key).await.unwrap();
        assert_eq!(record.status.state, LifecycleState::Running);
        assert_eq!(h.cloud.calls().create, 1);
    }

    #[tokio::test]
    async fn test_expired_wait_window_is_timeout() {
        let h = Harness::new(FakeCloud::new().with_boot_sequence([InstanceState::Pending]));
        let key = h.create("web").await;
        h.reconciler.reconcile(&key).await.unwrap();

        let mut record = h.record(&key).await.unwrap();
        record.status.wait_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        record.status.next_check_after = None;
        h.store.update_status(&record).await.unwrap();

        let err = h.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::WaitTimeout { target: InstanceState::Running, .. }
        ));

        let record = h.record(&key).await.unwrap();
        assert_eq!(record.status.state, LifecycleState::Provisioning);
        assert_eq!(record.status.wait_deadline, None);
        assert_eq!(h.cloud.launched(), 1);
    }

    #[tokio::test]
    async fn test_empty_create_records_no_instance() {
        let h = Harness::new(FakeCloud::new());
        h.cloud.create_returns_nothing(true);
        let key = h.create("web").await;

        let err = h.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ControllerError::EmptyResult { .. }));

        let record = h.record(&key).await.unwrap();
        // Finalizer and launch marker went on before the provider call.
        assert_eq!(record.status.state, LifecycleState::Provisioning);
        assert_eq!(record.status.instance_id, None);
        assert!(record.metadata.has_finalizer(FINALIZER));
    }

    #[tokio::test]
    async fn test_create_failure_is_provider_call() {
        let h = Harness::new(FakeCloud::new());
        h.cloud.fail_creates(1);
        let key = h.create("web").await;

        assert!(matches!(
            h.reconciler.reconcile(&key).await,
            Err(ControllerError::ProviderCall(_))
        ));
        assert_eq!(h.record(&key).await.unwrap().status.instance_id, None);
    }

    #[tokio::test]
    async fn test_lost_status_write_does_not_launch_twice() {
        let h = Harness::new(FakeCloud::new());
        let key = h.create("web").await;
        h.store.fail_status_writes_after(1, 1);

        assert!(h.reconciler.reconcile(&key).await.is_err());
        assert_eq!(h.record(&key).await.unwrap().status.instance_id, None);

        h.reconciler.reconcile(&key).await.unwrap();
        let record = h.record(&key).await.unwrap();
        assert_eq!(record.status.instance_id.as_deref(), Some("i-mock123456"));
        assert_eq!(record.status.state, LifecycleState::Running);
        assert_eq!(h.cloud.calls().create, 2);
        assert_eq!(h.cloud.launched(), 1);
    }

    #[tokio::test]
    async fn test_failed_launch_marker_prevents_launch() {
        let h = Harness::new(FakeCloud::new());
        let key = h.create("web").await;
        h.store.fail_status_writes(1);

        assert!(matches!(
            h.reconciler.reconcile(&key).await,
            Err(ControllerError::Io(_))
        ));
        assert_eq!(h.cloud.calls().create, 0);
    }

    #[tokio::test]
    async fn test_deletion_finds_instance_whose_id_was_lost() {
        let h = Harness::new(FakeCloud::new());
        let key = h.create("web").await;
        h.store.fail_status_writes_after(1, 1);
        assert!(h.reconciler.reconcile(&key).await.is_err());
        assert_eq!(h.cloud.launched(), 1);

        h.store.delete(&key).await.unwrap();
        assert_eq!(h.reconciler.reconcile(&key).await.unwrap(), Action::Requeue(POLL));
        let mut record = h.record(&key).await.unwrap();
        assert_eq!(record.status.instance_id.as_deref(), Some("i-mock123456"));
        assert_eq!(record.status.state, LifecycleState::Terminating);
        assert_eq!(h.cloud.calls().terminate, 1);

        record.status.next_check_after = None;
        h.store.update_status(&record).await.unwrap();
        assert_eq!(h.reconciler.reconcile(&key).await.unwrap(), Action::AwaitChange);
        assert!(h.record(&key).await.is_none());
        assert_eq!(h.cloud.calls().terminate, 1);
    }

    #[tokio::test]
    async fn test_vanished_instance_is_relaunched_under_new_token() {
        let h = Harness::new(FakeCloud::new().with_boot_sequence([InstanceState::Pending]));
        let key = h.create("web").await;
        h.reconciler.reconcile(&key).await.unwrap();
        assert!(h.cloud.remove_instance("i-mock123456"));

        // Not found inside the window is still eventual consistency.
        let mut record = h.record(&key).await.unwrap();
        record.status.next_check_after = None;
        h.store.update_status(&record).await.unwrap();
        assert_eq!(h.reconciler.reconcile(&key).await.unwrap(), Action::Requeue(POLL));

        let mut record = h.record(&key).await.unwrap();
        record.status.wait_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        record.status.next_check_after = None;
        h.store.update_status(&record).await.unwrap();

        let err = h.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ControllerError::InstanceMissing { .. }));
        let record = h.record(&key).await.unwrap();
        assert_eq!(record.status.state, LifecycleState::Unprovisioned);
        assert_eq!(record.status.instance_id, None);
        assert_eq!(record.status.launch_generation, 1);
        assert!(record.metadata.has_finalizer(FINALIZER));

        assert_eq!(h.reconciler.reconcile(&key).await.unwrap(), Action::Requeue(POLL));
        let record = h.record(&key).await.unwrap();
        assert_eq!(record.status.instance_id.as_deref(), Some("i-mock123457"));
        assert_eq!(h.cloud.calls().create, 2);
        assert_eq!(h.cloud.launched(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let h = Harness::new(FakeCloud::new());
        let key = h.create("web").await;
        h.store.conflict_writes(MAX_CONFLICT_RETRIES - 1);

        h.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(
            h.record(&key).await.unwrap().status.state,
            LifecycleState::Running
        );
    }

    #[tokio::test]
    async fn test_persistent_conflict_surfaces() {
        let h = Harness::new(FakeCloud::new());
        let key = h.create("web").await;
        h.store.conflict_writes(MAX_CONFLICT_RETRIES);

        assert!(matches!(
            h.reconciler.reconcile(&key).await,
            Err(ControllerError::PersistConflict(_))
        ));
        assert_eq!(h.cloud.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_deletion_without_instance_releases_record() {
        let h = Harness::new(FakeCloud::new());
        h.cloud.fail_creates(1);
        let key = h.create("web").await;
        assert!(h.reconciler.reconcile(&key).await.is_err());

        h.store.delete(&key).await.unwrap();
        assert!(h.record(&key).await.is_some());

        h.reconciler.reconcile(&key).await.unwrap();
        assert!(h.record(&key).await.is_none());
        assert_eq!(h.cloud.calls().terminate, 0);
    }

    #[tokio::test]
    async fn test_deletion_terminates_then_releases() {
        let h = Harness::new(FakeCloud::new());
        let key = h.create("web").await;
        h.reconciler.reconcile(&key).await.unwrap();
        h.store.delete(&key).await.unwrap();

        // terminate -> shutting-down
        assert_eq!(h.reconciler.reconcile(&key).await.unwrap(), Action::Requeue(POLL));
        let record = h.record(&key).await.unwrap();
        assert_eq!(record.status.state, LifecycleState::Terminating);
        assert!(record.metadata.has_finalizer(FINALIZER));

        let mut record = record;
        record.status.next_check_after = None;
        h.store.update_status(&record).await.unwrap();

        // describe -> terminated
        assert_eq!(h.reconciler.reconcile(&key).await.unwrap(), Action::AwaitChange);
        assert!(h.record(&key).await.is_none());
        assert_eq!(h.cloud.calls().terminate, 1);
    }

    #[tokio::test]
    async fn test_rejected_confirmation_keeps_finalizer() {
        let h = Harness::new(FakeCloud::new());
        let key = h.create("web").await;
        h.reconciler.reconcile(&key).await.unwrap();
        h.store.delete(&key).await.unwrap();
        h.cloud.fail_describes(1);

        assert!(matches!(
            h.reconciler.reconcile(&key).await,
            Err(ControllerError::ProviderCall(_))
        ));
        let record = h.record(&key).await.unwrap();
        assert!(record.metadata.has_finalizer(FINALIZER));
        assert_eq!(record.status.state, LifecycleState::Terminating);
    }

    #[tokio::test]
    async fn test_stuck_termination_times_out_and_reissues() {
        let h = Harness::new(FakeCloud::new().with_shutdown_sequence([InstanceState::ShuttingDown]));
        let key = h.create("web").await;
        h.reconciler.reconcile(&key).await.unwrap();
        h.store.delete(&key).await.unwrap();
        h.reconciler.reconcile(&key).await.unwrap();

        let mut record = h.record(&key).await.unwrap();
        record.status.wait_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        record.status.next_check_after = None;
        h.store.update_status(&record).await.unwrap();

        assert!(matches!(
            h.reconciler.reconcile(&key).await,
            Err(ControllerError::WaitTimeout { target: InstanceState::Terminated, .. })
        ));
        assert!(h.record(&key).await.unwrap().metadata.has_finalizer(FINALIZER));

        h.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(h.cloud.calls().terminate, 2);
    }

    #[tokio::test]
    async fn test_record_error_sets_last_error() {
        let h = Harness::new(FakeCloud::new());
        let key = h.create("web").await;

        h.reconciler
            .record_error(&key, &ControllerError::EmptyResult { operation: "create_instances" })
            .await;
        assert_eq!(
            h.record(&key).await.unwrap().status.last_error.as_deref(),
            Some("create_instances returned no instances")
        );
    }
}
