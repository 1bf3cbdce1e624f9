//! Controller runtime
//!
//! Feeds record keys to the reconciler from three triggers: store watch
//! events, a periodic resync of every key, and the requeue/backoff timers
//! that passes ask for. Different keys are reconciled in parallel up to
//! `workers`; one key never has two passes at once.

use crate::error::{ControllerError, Result};
use crate::model::RecordKey;
use crate::queue::WorkQueue;
use crate::reconciler::{Action, Reconciler};
use crate::store::{ChangeKind, StoreEvent};
use instanceflow_cloud::RetryConfig;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{Id, JoinSet};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Maximum passes running at once
    pub workers: usize,
    pub resync_interval: Duration,
    pub retry: RetryConfig,
    /// Consecutive failures of one key before it is reported at error level
    pub alert_after_failures: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(60),
            retry: RetryConfig::default(),
            alert_after_failures: 5,
        }
    }
}

pub struct Controller {
    reconciler: Arc<Reconciler>,
    config: ControllerConfig,
}

type PassResult = (RecordKey, Result<Action>);

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>, config: ControllerConfig) -> Self {
        Self { reconciler, config }
    }

    /// Run until `cancel` fires, then wait for passes in flight
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let store = self.reconciler.store().clone();
        let mut events = Some(store.watch());

        let mut resync = interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut queue: WorkQueue<RecordKey> = WorkQueue::new();
        let mut workers: JoinSet<PassResult> = JoinSet::new();
        let mut timers: JoinSet<RecordKey> = JoinSet::new();
        let mut passes: HashMap<Id, RecordKey> = HashMap::new();
        let mut failures: HashMap<RecordKey, u32> = HashMap::new();

        info!(
            workers = self.config.workers,
            resync_secs = self.config.resync_interval.as_secs(),
            "controller started"
        );

        loop {
            while workers.len() < self.config.workers {
                let Some(key) = queue.next() else { break };
                let id = self.spawn_pass(&mut workers, key.clone());
                passes.insert(id, key);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("controller shutting down");
                    break;
                }
                _ = resync.tick() => {
                    match store.list_keys().await {
                        Ok(keys) => {
                            debug!(records = keys.len(), "resync");
                            for key in keys {
                                queue.add(key);
                            }
                        }
                        Err(e) => warn!(error = %e, "resync failed to list records"),
                    }
                }
                event = next_event(&mut events) => {
                    match event {
                        Ok(StoreEvent { change: ChangeKind::StatusUpdated, .. }) => {
                            // Status writes come from passes, which requeue themselves.
                        }
                        Ok(StoreEvent { key, change }) => {
                            debug!(key = %key, ?change, "record changed");
                            queue.add(key);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "watch lagged, resyncing");
                            resync.reset_immediately();
                        }
                        Err(RecvError::Closed) => {
                            warn!("watch closed, relying on resync");
                            events = None;
                        }
                    }
                }
                Some(fired) = timers.join_next(), if !timers.is_empty() => {
                    if let Ok(key) = fired {
                        queue.add(key);
                    }
                }
                Some(joined) = workers.join_next_with_id(), if !workers.is_empty() => {
                    match joined {
                        Ok((id, (key, outcome))) => {
                            passes.remove(&id);
                            self.handle_outcome(&key, outcome, &mut queue, &mut timers, &mut failures);
                            queue.done(&key);
                        }
                        Err(e) => {
                            let Some(key) = passes.remove(&e.id()) else {
                                error!(error = %e, "reconcile task failed");
                                continue;
                            };
                            self.back_off(&key, &e, &mut timers, &mut failures);
                            queue.done(&key);
                        }
                    }
                }
            }
        }

        timers.abort_all();
        while let Some(joined) = workers.join_next().await {
            if let Ok((key, Err(e))) = joined {
                warn!(key = %key, error = %e, "pass failed during shutdown");
            }
        }
        info!("controller stopped");
        Ok(())
    }

    fn spawn_pass(&self, workers: &mut JoinSet<PassResult>, key: RecordKey) -> Id {
        let reconciler = self.reconciler.clone();
        let span = info_span!("reconcile", key = %key);
        let handle = workers.spawn(
            async move {
                let outcome = reconciler.reconcile(&key).await;
                if let Err(e) = &outcome {
                    if !matches!(e, ControllerError::PersistConflict(_)) {
                        reconciler.record_error(&key, e).await;
                    }
                }
                (key, outcome)
            }
            .instrument(span),
        );
        handle.id()
    }

    fn handle_outcome(
        &self,
        key: &RecordKey,
        outcome: Result<Action>,
        queue: &mut WorkQueue<RecordKey>,
        timers: &mut JoinSet<RecordKey>,
        failures: &mut HashMap<RecordKey, u32>,
    ) {
        match outcome {
            Ok(Action::AwaitChange) => {
                failures.remove(key);
            }
            Ok(Action::Requeue(delay)) => {
                failures.remove(key);
                schedule(timers, key.clone(), delay);
            }
            Err(ControllerError::PersistConflict(_)) => {
                debug!(key = %key, "write conflict, retrying now");
                queue.add(key.clone());
            }
            Err(e) => self.back_off(key, &e, timers, failures),
        }
    }

    /// Count a failed (or panicked) pass and retry the key after its backoff delay
    fn back_off(
        &self,
        key: &RecordKey,
        reason: &dyn Display,
        timers: &mut JoinSet<RecordKey>,
        failures: &mut HashMap<RecordKey, u32>,
    ) {
        let count = failures.entry(key.clone()).or_insert(0);
        *count += 1;
        let delay = self.config.retry.delay_for_attempt(*count - 1);

        if *count >= self.config.alert_after_failures {
            error!(
                key = %key,
                failures = *count,
                retry_in_ms = delay.as_millis() as u64,
                error = %reason,
                "reconcile keeps failing"
            );
        } else {
            warn!(
                key = %key,
                failures = *count,
                retry_in_ms = delay.as_millis() as u64,
                error = %reason,
                "reconcile failed"
            );
        }
        schedule(timers, key.clone(), delay);
    }
}

fn schedule(timers: &mut JoinSet<RecordKey>, key: RecordKey, delay: Duration) {
    timers.spawn(async move {
        sleep(delay).await;
        key
    });
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<StoreEvent>>,
) -> std::result::Result<StoreEvent, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
