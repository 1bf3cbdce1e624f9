//! Instance termination

use crate::error::{ControllerError, Result};
use crate::provisioner::pick;
use instanceflow_cloud::{CloudClient, CloudError, InstanceState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// How long a terminating instance may take to reach `terminated`
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationProgress {
    Terminated,
    InProgress(InstanceState),
}

pub struct InstanceTerminator {
    client: Arc<dyn CloudClient>,
    poll_interval: Duration,
}

impl InstanceTerminator {
    pub fn new(client: Arc<dyn CloudClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Issue the terminate call and return the state the provider moved the instance to
    ///
    /// An instance the provider no longer knows is already gone and reported as `Terminated`.
    pub async fn request_termination(&self, region: &str, instance_id: &str) -> Result<InstanceState> {
        tracing::info!(instance_id = %instance_id, region = %region, "terminating instance");

        let changes = match self.client.terminate_instances(region, instance_id).await {
            Ok(changes) => changes,
            Err(CloudError::InstanceNotFound(_)) => {
                tracing::warn!(instance_id = %instance_id, "instance already gone");
                return Ok(InstanceState::Terminated);
            }
            Err(e) => return Err(e.into()),
        };

        let change = pick(changes, instance_id).ok_or(ControllerError::EmptyResult {
            operation: "terminate_instances",
        })?;
        tracing::info!(
            instance_id = %instance_id,
            previous = %change.previous_state,
            current = %change.current_state,
            "termination requested"
        );
        Ok(change.current_state)
    }

    /// Describe the instance once and report whether termination has finished
    pub async fn confirm_termination(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<TerminationProgress> {
        let described = match self.client.describe_instances(region, instance_id).await {
            Ok(described) => described,
            Err(CloudError::InstanceNotFound(_)) => {
                tracing::debug!(instance_id = %instance_id, "instance no longer listed");
                return Ok(TerminationProgress::Terminated);
            }
            Err(e) => return Err(e.into()),
        };

        let description = pick(described, instance_id).ok_or(ControllerError::EmptyResult {
            operation: "describe_instances",
        })?;
        Ok(match description.state {
            InstanceState::Terminated => TerminationProgress::Terminated,
            state => TerminationProgress::InProgress(state),
        })
    }

    /// Terminate and wait for confirmation. Returns `true` once the provider confirms.
    pub async fn terminate(
        &self,
        region: &str,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if self.request_termination(region, instance_id).await? == InstanceState::Terminated {
            return Ok(true);
        }
        let deadline = Instant::now() + TERMINATE_TIMEOUT;

        loop {
            if cancel.is_cancelled() {
                return Err(ControllerError::Cancelled);
            }
            match self.confirm_termination(region, instance_id).await? {
                TerminationProgress::Terminated => {
                    tracing::info!(instance_id = %instance_id, "instance terminated");
                    return Ok(true);
                }
                TerminationProgress::InProgress(state) => {
                    tracing::debug!(instance_id = %instance_id, state = %state, "waiting for termination");
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(ControllerError::WaitTimeout {
                    instance_id: instance_id.to_string(),
                    target: InstanceState::Terminated,
                    timeout: TERMINATE_TIMEOUT,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ControllerError::Cancelled),
                _ = sleep(self.poll_interval) => {}
            }
        }
    }
}
