//! Instance provisioning
//!
//! `launch` and `observe` are the single steps the reconciler drives across
//! passes; `provision` chains them into one blocking, cancellable call.

use crate::error::{ControllerError, Result};
use crate::model::{CreatedInstanceInfo, DesiredInstanceSpec};
use instanceflow_cloud::{CloudClient, CloudError, CreateInstancesRequest, InstanceState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// How long a launched instance may take to reach `running`
pub const PROVISION_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Result of one look at a launching instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Running(CreatedInstanceInfo),
    Pending(InstanceState),
    /// The provider does not know the instance (yet, or any more)
    Missing,
}

/// Build the single-instance launch request for a spec
pub fn create_request(
    spec: &DesiredInstanceSpec,
    client_token: Option<&str>,
) -> CreateInstancesRequest {
    let mut request = CreateInstancesRequest::single(&spec.ami_id, &spec.instance_type);
    request.key_name = spec.key_pair.clone();
    request.subnet_id = spec.subnet.clone();
    request.availability_zone = spec.availability_zone.clone();
    request.security_group_ids = spec.security_groups.clone();
    request.user_data = spec.user_data.clone();
    request.tags = spec.tags.clone();
    request.associate_public_ip = spec.associate_public_ip;
    request.block_devices = spec.block_devices();
    request.client_token = client_token.map(str::to_string);
    request
}

pub struct InstanceProvisioner {
    client: Arc<dyn CloudClient>,
    poll_interval: Duration,
}

impl InstanceProvisioner {
    pub fn new(client: Arc<dyn CloudClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Issue the create call and return the new instance id
    pub async fn launch(
        &self,
        spec: &DesiredInstanceSpec,
        client_token: Option<&str>,
    ) -> Result<String> {
        let request = create_request(spec, client_token);
        tracing::info!(
            ami = %spec.ami_id,
            instance_type = %spec.instance_type,
            region = %spec.region,
            "launching instance"
        );

        let created = self
            .client
            .create_instances(&spec.region, &request)
            .await?;
        let instance = created
            .into_iter()
            .next()
            .ok_or(ControllerError::EmptyResult {
                operation: "create_instances",
            })?;

        tracing::info!(instance_id = %instance.instance_id, state = %instance.state, "instance launched");
        Ok(instance.instance_id)
    }

    /// Describe the instance once
    ///
    /// "Not found" is reported as `Missing`; right after a launch it is
    /// normal eventual consistency. An instance heading to a stop or
    /// termination is reported as `UnexpectedState`.
    pub async fn observe(&self, region: &str, instance_id: &str) -> Result<Observation> {
        let described = match self.client.describe_instances(region, instance_id).await {
            Ok(described) => described,
            Err(CloudError::InstanceNotFound(_)) => {
                tracing::debug!(instance_id = %instance_id, "instance not visible");
                return Ok(Observation::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        let description = pick(described, instance_id).ok_or(ControllerError::EmptyResult {
            operation: "describe_instances",
        })?;

        match description.state {
            InstanceState::Running => Ok(Observation::Running(description.into())),
            InstanceState::Pending => Ok(Observation::Pending(InstanceState::Pending)),
            actual => Err(ControllerError::UnexpectedState {
                instance_id: instance_id.to_string(),
                actual,
                expected: InstanceState::Running,
            }),
        }
    }

    /// An instance launched under `client_token` that has not terminated yet
    pub async fn find_launched(&self, region: &str, client_token: &str) -> Result<Option<String>> {
        let launched = self.client.find_by_client_token(region, client_token).await?;
        Ok(launched
            .into_iter()
            .find(|d| d.state != InstanceState::Terminated)
            .map(|d| d.instance_id))
    }

    /// Launch an instance and wait until it is running, returning its network identity
    pub async fn provision(
        &self,
        spec: &DesiredInstanceSpec,
        cancel: &CancellationToken,
    ) -> Result<CreatedInstanceInfo> {
        let instance_id = self.launch(spec, None).await?;
        let deadline = Instant::now() + PROVISION_TIMEOUT;

        loop {
            if cancel.is_cancelled() {
                return Err(ControllerError::Cancelled);
            }
            match self.observe(&spec.region, &instance_id).await? {
                Observation::Running(info) => {
                    tracing::info!(
                        instance_id = %info.instance_id,
                        public_ip = info.public_ip.as_deref().unwrap_or("-"),
                        "instance running"
                    );
                    return Ok(info);
                }
                Observation::Pending(state) => {
                    tracing::debug!(instance_id = %instance_id, state = %state, "waiting for instance");
                }
                Observation::Missing => {
                    tracing::debug!(instance_id = %instance_id, "waiting for instance to appear");
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(ControllerError::WaitTimeout {
                    instance_id,
                    target: InstanceState::Running,
                    timeout: PROVISION_TIMEOUT,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ControllerError::Cancelled),
                _ = sleep(self.poll_interval) => {}
            }
        }
    }
}

/// The entry for `instance_id`; entries for other instances are never substituted
pub(crate) fn pick<T: AsInstanceId>(descriptions: Vec<T>, instance_id: &str) -> Option<T> {
    descriptions
        .into_iter()
        .find(|d| d.as_instance_id() == instance_id)
}

pub(crate) trait AsInstanceId {
    fn as_instance_id(&self) -> &str;
}

impl AsInstanceId for instanceflow_cloud::InstanceDescription {
    fn as_instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl AsInstanceId for instanceflow_cloud::InstanceStateChange {
    fn as_instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instanceflow_cloud::{FakeCloud, InstanceDescription};

    fn spec() -> DesiredInstanceSpec {
        let mut spec = DesiredInstanceSpec::new("ami-1", "t2.micro", "us-east-1");
        spec.subnet = Some("subnet-1".to_string());
        spec
    }

    fn provisioner(cloud: &Arc<FakeCloud>) -> InstanceProvisioner {
        InstanceProvisioner::new(cloud.clone(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_provision_returns_network_identity() {
        let cloud = Arc::new(FakeCloud::new());
        let info = provisioner(&cloud)
            .provision(&spec(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(info.instance_id, "i-mock123456");
        assert_eq!(info.state, InstanceState::Running);
        assert_eq!(info.public_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(info.private_ip.as_deref(), Some("10.0.0.1"));

        let request = cloud.last_create_request().unwrap();
        assert_eq!(request.count(), 1);
        assert_eq!(request.subnet_id.as_deref(), Some("subnet-1"));
    }

    #[tokio::test]
    async fn test_empty_create_is_an_error() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.create_returns_nothing(true);

        assert!(matches!(
            provisioner(&cloud).launch(&spec(), None).await,
            Err(ControllerError::EmptyResult { operation: "create_instances" })
        ));
    }

    #[tokio::test]
    async fn test_create_failure_is_provider_call() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_creates(1);

        let err = provisioner(&cloud)
            .provision(&spec(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ProviderCall(_)));
        assert_eq!(cloud.calls().describe, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_running_times_out() {
        let cloud = Arc::new(FakeCloud::new().with_boot_sequence([InstanceState::Pending]));
        let started = Instant::now();

        let err = provisioner(&cloud)
            .provision(&spec(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ControllerError::WaitTimeout { target: InstanceState::Running, .. }
        ));
        assert!(started.elapsed() <= PROVISION_TIMEOUT);
        assert!(cloud.calls().describe > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_waiting() {
        let cloud = Arc::new(FakeCloud::new().with_boot_sequence([InstanceState::Pending]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let err = provisioner(&cloud).provision(&spec(), &cancel).await.unwrap_err();
        assert!(matches!(err, ControllerError::Cancelled));
    }

    #[tokio::test]
    async fn test_observe_not_found_is_missing() {
        let cloud = Arc::new(FakeCloud::new());
        let observation = provisioner(&cloud)
            .observe("us-east-1", "i-unknown")
            .await
            .unwrap();
        assert_eq!(observation, Observation::Missing);
    }

    #[tokio::test]
    async fn test_find_launched_by_client_token() {
        let cloud = Arc::new(FakeCloud::new());
        let provisioner = provisioner(&cloud);
        provisioner.launch(&spec(), Some("token-1")).await.unwrap();

        let found = provisioner.find_launched("us-east-1", "token-1").await.unwrap();
        assert_eq!(found.as_deref(), Some("i-mock123456"));
        assert_eq!(
            provisioner.find_launched("us-east-1", "token-2").await.unwrap(),
            None
        );
        assert_eq!(
            provisioner.find_launched("eu-west-1", "token-1").await.unwrap(),
            None
        );
    }

    #[test]
    fn test_pick_never_substitutes_another_instance() {
        let descriptions = vec![
            InstanceDescription::new("i-other", InstanceState::Terminated),
            InstanceDescription::new("i-1", InstanceState::Running),
        ];
        let picked = pick(descriptions, "i-1").unwrap();
        assert_eq!(picked.state, InstanceState::Running);

        let descriptions = vec![InstanceDescription::new("i-other", InstanceState::Terminated)];
        assert!(pick(descriptions, "i-1").is_none());
    }

    #[tokio::test]
    async fn test_observe_rejects_stopped_instance() {
        let cloud = Arc::new(FakeCloud::new().with_boot_sequence([InstanceState::Stopped]));
        let provisioner = provisioner(&cloud);
        let id = provisioner.launch(&spec(), None).await.unwrap();

        assert!(matches!(
            provisioner.observe("us-east-1", &id).await,
            Err(ControllerError::UnexpectedState { actual: InstanceState::Stopped, .. })
        ));
    }

    #[tokio::test]
    async fn test_observe_empty_describe() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.describe_returns_nothing(true);

        assert!(matches!(
            provisioner(&cloud).observe("us-east-1", "i-1").await,
            Err(ControllerError::EmptyResult { operation: "describe_instances" })
        ));
    }
}
