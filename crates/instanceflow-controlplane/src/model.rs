//! Declarative instance records
//!
//! A record pairs user-owned desired state (`spec`, immutable once created)
//! with controller-owned observed state (`status`). Metadata carries the
//! deletion marker and the finalizer that keeps a record alive until its
//! instance is gone.

use chrono::{DateTime, Utc};
use instanceflow_cloud::{InstanceDescription, InstanceState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Finalizer held by every record with a (possibly) live instance
pub const FINALIZER: &str = "ec2instance.compute.cloud.com";

pub const DEFAULT_NAMESPACE: &str = "default";

const ROOT_DEVICE_NAME: &str = "/dev/xvda";
/// Unnamed additional volumes take the letters `f` through `z`
const ADDITIONAL_DEVICE_LETTERS: std::ops::RangeInclusive<u8> = b'f'..=b'z';
pub const MAX_ADDITIONAL_VOLUMES: usize = 21;
const DEFAULT_VOLUME_TYPE: &str = "gp3";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_volume_type() -> String {
    DEFAULT_VOLUME_TYPE.to_string()
}

/// `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub namespace: String,
    pub name: String,
}

impl RecordKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key in the default namespace
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_NAMESPACE, name)
    }

    /// Parse `namespace/name` or a bare `name`
    pub fn parse(value: &str) -> Self {
        match value.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::named(value),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Assigned by the store on create
    #[serde(default)]
    pub uid: Uuid,
    /// Bumped by the store on every write
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Deletion marker; set by the store when deletion is requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(key: &RecordKey) -> Self {
        Self {
            name: key.name.clone(),
            namespace: key.namespace.clone(),
            uid: Uuid::nil(),
            resource_version: 0,
            creation_timestamp: None,
            deletion_timestamp: None,
            finalizers: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns `true` if the finalizer was added
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns `true` if the finalizer was present
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Block device in a spec. Sizes are in GiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub size_gb: i32,
    #[serde(default = "default_volume_type")]
    pub volume_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_volume: Option<VolumeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_volumes: Vec<VolumeSpec>,
}

/// Desired instance configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredInstanceSpec {
    pub ami_id: String,
    pub instance_type: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    /// Bootstrap script, passed to the instance verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub associate_public_ip: bool,
    #[serde(default)]
    pub storage: StorageSpec,
}

impl DesiredInstanceSpec {
    pub fn new(
        ami_id: impl Into<String>,
        instance_type: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            ami_id: ami_id.into(),
            instance_type: instance_type.into(),
            region: region.into(),
            availability_zone: None,
            key_pair: None,
            security_groups: Vec::new(),
            subnet: None,
            user_data: None,
            tags: BTreeMap::new(),
            associate_public_ip: false,
            storage: StorageSpec::default(),
        }
    }

    /// Reason the spec cannot be launched, if any
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("amiId", &self.ami_id),
            ("instanceType", &self.instance_type),
            ("region", &self.region),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty", field));
            }
        }
        if self.storage.additional_volumes.len() > MAX_ADDITIONAL_VOLUMES {
            return Err(format!(
                "at most {} additional volumes are supported, got {}",
                MAX_ADDITIONAL_VOLUMES,
                self.storage.additional_volumes.len()
            ));
        }
        let volumes = self
            .storage
            .root_volume
            .iter()
            .chain(self.storage.additional_volumes.iter());
        for volume in volumes {
            if volume.size_gb <= 0 {
                return Err(format!("volume size must be positive, got {}", volume.size_gb));
            }
        }
        Ok(())
    }

    /// Block devices in launch order. Unnamed additional volumes get `/dev/sdf`, `/dev/sdg`, ...
    ///
    /// Volumes past `MAX_ADDITIONAL_VOLUMES` are rejected by `validate` and left out here.
    pub fn block_devices(&self) -> Vec<instanceflow_cloud::BlockDevice> {
        let root = self.storage.root_volume.iter().map(|volume| (volume, ROOT_DEVICE_NAME.to_string()));
        let additional = self
            .storage
            .additional_volumes
            .iter()
            .zip(ADDITIONAL_DEVICE_LETTERS)
            .map(|(volume, letter)| (volume, format!("/dev/sd{}", char::from(letter))));

        root.chain(additional)
            .map(|(volume, fallback)| instanceflow_cloud::BlockDevice {
                device_name: volume.device_name.clone().unwrap_or(fallback),
                size_gb: volume.size_gb,
                volume_type: volume.volume_type.clone(),
                encrypted: volume.encrypted,
            })
            .collect()
    }
}

/// Controller-side lifecycle of a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Unprovisioned,
    Provisioning,
    Running,
    Terminating,
    Terminated,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Unprovisioned => write!(f, "unprovisioned"),
            LifecycleState::Provisioning => write!(f, "provisioning"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Terminating => write!(f, "terminating"),
            LifecycleState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Observed state, written only by the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedInstanceStatus {
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_dns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_dns: Option<String>,
    /// End of the current start/stop wait window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_deadline: Option<DateTime<Utc>>,
    /// Earliest time the provider should be polled again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_check_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Number of launches abandoned because their instance disappeared
    #[serde(default, skip_serializing_if = "is_zero")]
    pub launch_generation: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl ObservedInstanceStatus {
    pub fn clear_wait(&mut self) {
        self.wait_deadline = None;
        self.next_check_after = None;
    }

    pub fn apply_instance(&mut self, info: &CreatedInstanceInfo) {
        self.instance_id = Some(info.instance_id.clone());
        self.public_ip = info.public_ip.clone();
        self.private_ip = info.private_ip.clone();
        self.public_dns = info.public_dns.clone();
        self.private_dns = info.private_dns.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub metadata: ObjectMeta,
    pub spec: DesiredInstanceSpec,
    #[serde(default)]
    pub status: ObservedInstanceStatus,
}

impl InstanceRecord {
    pub fn new(key: &RecordKey, spec: DesiredInstanceSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(key),
            spec,
            status: ObservedInstanceStatus::default(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Provider idempotency token for this record's current launch
    ///
    /// A relaunch after the instance vanished bumps `launch_generation`, so
    /// the provider does not replay the lost instance.
    pub fn client_token(&self) -> String {
        match self.status.launch_generation {
            0 => format!("instanceflow-{}", self.metadata.uid),
            generation => format!("instanceflow-{}-{}", self.metadata.uid, generation),
        }
    }
}

/// Network identity of a running instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstanceInfo {
    pub instance_id: String,
    pub state: InstanceState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub public_dns: Option<String>,
    pub private_dns: Option<String>,
}

impl From<InstanceDescription> for CreatedInstanceInfo {
    fn from(description: InstanceDescription) -> Self {
        Self {
            instance_id: description.instance_id,
            state: description.state,
            public_ip: description.public_ip,
            private_ip: description.private_ip,
            public_dns: description.public_dns,
            private_dns: description.private_dns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_parse() {
        assert_eq!(RecordKey::parse("team-a/web"), RecordKey::new("team-a", "web"));
        assert_eq!(RecordKey::parse("web"), RecordKey::named("web"));
        assert_eq!(RecordKey::named("web").to_string(), "default/web");
    }

    #[test]
    fn test_spec_uses_camel_case() {
        let json = r#"{
            "amiId": "ami-1",
            "instanceType": "t2.micro",
            "region": "us-east-1",
            "subnet": "subnet-1",
            "securityGroups": ["sg-1"],
            "associatePublicIp": true,
            "storage": {
                "rootVolume": { "sizeGb": 20 },
                "additionalVolumes": [
                    { "sizeGb": 100, "volumeType": "st1", "encrypted": true }
                ]
            }
        }"#;
        let spec: DesiredInstanceSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.ami_id, "ami-1");
        assert_eq!(spec.subnet.as_deref(), Some("subnet-1"));
        assert!(spec.associate_public_ip);

        let devices = spec.block_devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_name, "/dev/xvda");
        assert_eq!(devices[0].volume_type, "gp3");
        assert_eq!(devices[1].device_name, "/dev/sdf");
        assert_eq!(devices[1].volume_type, "st1");
        assert!(devices[1].encrypted);
    }

    #[test]
    fn test_validate_rejects_blank_fields() {
        let spec = DesiredInstanceSpec::new("", "t2.micro", "us-east-1");
        assert_eq!(spec.validate(), Err("amiId must not be empty".to_string()));

        let mut spec = DesiredInstanceSpec::new("ami-1", "t2.micro", "us-east-1");
        spec.storage.root_volume = Some(VolumeSpec {
            size_gb: 0,
            volume_type: "gp3".to_string(),
            device_name: None,
            encrypted: false,
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_additional_volumes_are_bounded() {
        let volume = VolumeSpec {
            size_gb: 10,
            volume_type: "gp3".to_string(),
            device_name: None,
            encrypted: false,
        };
        let mut spec = DesiredInstanceSpec::new("ami-1", "t2.micro", "us-east-1");
        spec.storage.additional_volumes = vec![volume.clone(); MAX_ADDITIONAL_VOLUMES];
        assert_eq!(spec.validate(), Ok(()));
        let devices = spec.block_devices();
        assert_eq!(devices.len(), MAX_ADDITIONAL_VOLUMES);
        assert_eq!(devices.last().unwrap().device_name, "/dev/sdz");

        spec.storage.additional_volumes.push(volume);
        assert!(spec.validate().unwrap_err().contains("at most 21"));
    }

    #[test]
    fn test_client_token_follows_launch_generation() {
        let mut record = InstanceRecord::new(
            &RecordKey::named("web"),
            DesiredInstanceSpec::new("ami-1", "t2.micro", "us-east-1"),
        );
        record.metadata.uid = Uuid::from_u128(7);
        let first = record.client_token();
        assert_eq!(first, format!("instanceflow-{}", Uuid::from_u128(7)));

        record.status.launch_generation = 2;
        assert_eq!(record.client_token(), format!("{}-2", first));
    }

    #[test]
    fn test_finalizer_helpers() {
        let mut meta = ObjectMeta::new(&RecordKey::named("web"));
        assert!(meta.add_finalizer(FINALIZER));
        assert!(!meta.add_finalizer(FINALIZER));
        assert_eq!(meta.finalizers.len(), 1);
        assert!(meta.remove_finalizer(FINALIZER));
        assert!(!meta.has_finalizer(FINALIZER));
    }

    #[test]
    fn test_status_serializes_lowercase_state() {
        let status = ObservedInstanceStatus {
            state: LifecycleState::Provisioning,
            instance_id: Some("i-1".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "provisioning");
        assert_eq!(value["instanceId"], "i-1");
        assert!(value.get("publicIp").is_none());
    }
}
