//! Provider-side instance vocabulary and request/response value types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Instance state as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Launch accepted, not yet running
    Pending,
    /// Instance is running
    Running,
    /// Termination in progress
    ShuttingDown,
    /// Instance is gone
    Terminated,
    /// Stop in progress
    Stopping,
    /// Instance is stopped
    Stopped,
}

impl InstanceState {
    /// Translate the provider's state name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "shutting-down" => Some(Self::ShuttingDown),
            "terminated" => Some(Self::Terminated),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the instance is on its way out (or already gone)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// EBS-style block device attached at launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub device_name: String,
    pub size_gb: i32,
    pub volume_type: String,
    pub encrypted: bool,
}

/// Launch request for exactly one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstancesRequest {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub subnet_id: Option<String>,
    pub availability_zone: Option<String>,
    pub security_group_ids: Vec<String>,
    pub user_data: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub associate_public_ip: bool,
    pub block_devices: Vec<BlockDevice>,
    /// Idempotency token: repeating a launch with the same token yields the same instance
    pub client_token: Option<String>,
    count: i32,
}

impl CreateInstancesRequest {
    /// Build a request for a single instance of `instance_type` from `image_id`
    pub fn single(image_id: impl Into<String>, instance_type: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            instance_type: instance_type.into(),
            key_name: None,
            subnet_id: None,
            availability_zone: None,
            security_group_ids: Vec::new(),
            user_data: None,
            tags: BTreeMap::new(),
            associate_public_ip: false,
            block_devices: Vec::new(),
            client_token: None,
            count: 1,
        }
    }

    /// Number of instances requested. Always one.
    pub fn count(&self) -> i32 {
        self.count
    }
}

/// One instance as returned by create or describe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub public_dns: Option<String>,
    pub private_dns: Option<String>,
}

impl InstanceDescription {
    pub fn new(instance_id: impl Into<String>, state: InstanceState) -> Self {
        Self {
            instance_id: instance_id.into(),
            state,
            public_ip: None,
            private_ip: None,
            public_dns: None,
            private_dns: None,
        }
    }
}

/// State change reported by a terminate call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStateChange {
    pub instance_id: String,
    pub previous_state: InstanceState,
    pub current_state: InstanceState,
}
