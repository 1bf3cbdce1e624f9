//! `CloudClient` implementation over the EC2 API

use crate::convert::{describe_instance, map_sdk_error, run_instances_input, state_change};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::Filter;
use instanceflow_cloud::{
    CloudClient, CreateInstancesRequest, InstanceDescription, InstanceStateChange, Result,
};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// EC2 backend
///
/// SDK clients are region-bound, so one is built lazily per region and
/// cached for the lifetime of the backend.
pub struct Ec2CloudClient {
    clients: Mutex<HashMap<String, Client>>,
    endpoint_url: Option<String>,
}

impl Ec2CloudClient {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            endpoint_url: None,
        }
    }

    /// Send every request to a custom endpoint (e.g., LocalStack)
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    async fn client(&self, region: &str) -> Client {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(region) {
            return client.clone();
        }

        tracing::debug!(region = %region, "building EC2 client");
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(endpoint_url) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let client = Client::new(&loader.load().await);
        clients.insert(region.to_string(), client.clone());
        client
    }
}

impl Default for Ec2CloudClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudClient for Ec2CloudClient {
    fn name(&self) -> &str {
        "aws"
    }

    async fn create_instances(
        &self,
        region: &str,
        request: &CreateInstancesRequest,
    ) -> Result<Vec<InstanceDescription>> {
        const OPERATION: &str = "RunInstances";
        let client = self.client(region).await;

        tracing::info!(
            region = %region,
            image_id = %request.image_id,
            instance_type = %request.instance_type,
            "calling RunInstances"
        );
        let output = run_instances_input(request)
            .send_with(&client)
            .await
            .map_err(|e| map_sdk_error(OPERATION, None, e))?;

        output
            .instances()
            .iter()
            .map(|instance| describe_instance(OPERATION, instance))
            .collect()
    }

    async fn describe_instances(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Vec<InstanceDescription>> {
        const OPERATION: &str = "DescribeInstances";
        let client = self.client(region).await;

        let output = client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(OPERATION, Some(instance_id), e))?;

        output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .map(|instance| describe_instance(OPERATION, instance))
            .collect()
    }

    async fn find_by_client_token(
        &self,
        region: &str,
        client_token: &str,
    ) -> Result<Vec<InstanceDescription>> {
        const OPERATION: &str = "DescribeInstances";
        let client = self.client(region).await;

        let output = client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("client-token")
                    .values(client_token)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error(OPERATION, None, e))?;

        output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .map(|instance| describe_instance(OPERATION, instance))
            .collect()
    }

    async fn terminate_instances(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Vec<InstanceStateChange>> {
        let client = self.client(region).await;

        tracing::info!(region = %region, instance_id = %instance_id, "calling TerminateInstances");
        let output = client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("TerminateInstances", Some(instance_id), e))?;

        output.terminating_instances().iter().map(state_change).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_name() {
        assert_eq!(Ec2CloudClient::new().name(), "aws");
    }

    #[tokio::test]
    async fn test_client_cached_per_region() {
        let backend = Ec2CloudClient::new().with_endpoint_url("http://localhost:4566");
        backend.client("us-east-1").await;
        backend.client("us-east-1").await;
        backend.client("eu-west-1").await;

        assert_eq!(backend.clients.lock().await.len(), 2);
    }
}
