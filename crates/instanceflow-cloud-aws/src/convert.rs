//! Translation between InstanceFlow value types and EC2 SDK shapes

use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::operation::run_instances::builders::RunInstancesInputBuilder;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Instance, InstanceNetworkInterfaceSpecification,
    InstanceType, Placement, ResourceType, Tag, TagSpecification, VolumeType,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use instanceflow_cloud::{
    CloudError, CreateInstancesRequest, InstanceDescription, InstanceState, InstanceStateChange,
    Result,
};

const INSTANCE_NOT_FOUND_CODES: &[&str] = &["InvalidInstanceID.NotFound", "InvalidInstanceID.Malformed"];

/// Build the RunInstances input for a single-instance request
pub(crate) fn run_instances_input(request: &CreateInstancesRequest) -> RunInstancesInputBuilder {
    let mut input = RunInstancesInputBuilder::default()
        .image_id(&request.image_id)
        .instance_type(InstanceType::from(request.instance_type.as_str()))
        .min_count(request.count())
        .max_count(request.count())
        .set_key_name(request.key_name.clone())
        .set_client_token(request.client_token.clone());

    if let Some(zone) = &request.availability_zone {
        input = input.placement(Placement::builder().availability_zone(zone).build());
    }

    if let Some(user_data) = &request.user_data {
        input = input.user_data(STANDARD.encode(user_data.as_bytes()));
    }

    if request.associate_public_ip {
        // Public IP association is only expressible on the primary network interface,
        // and then subnet/groups must move there too.
        let groups = (!request.security_group_ids.is_empty())
            .then(|| request.security_group_ids.clone());
        input = input.network_interfaces(
            InstanceNetworkInterfaceSpecification::builder()
                .device_index(0)
                .associate_public_ip_address(true)
                .set_subnet_id(request.subnet_id.clone())
                .set_groups(groups)
                .build(),
        );
    } else {
        input = input.set_subnet_id(request.subnet_id.clone());
        for group in &request.security_group_ids {
            input = input.security_group_ids(group);
        }
    }

    if !request.tags.is_empty() {
        let tags = request
            .tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect::<Vec<_>>();
        input = input.tag_specifications(
            TagSpecification::builder()
                .resource_type(ResourceType::Instance)
                .set_tags(Some(tags))
                .build(),
        );
    }

    for device in &request.block_devices {
        input = input.block_device_mappings(
            BlockDeviceMapping::builder()
                .device_name(&device.device_name)
                .ebs(
                    EbsBlockDevice::builder()
                        .volume_size(device.size_gb)
                        .volume_type(VolumeType::from(device.volume_type.as_str()))
                        .encrypted(device.encrypted)
                        .delete_on_termination(true)
                        .build(),
                )
                .build(),
        );
    }

    input
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn parse_state(operation: &'static str, name: Option<&str>) -> Result<InstanceState> {
    let name = name.unwrap_or_default();
    InstanceState::parse(name).ok_or_else(|| {
        CloudError::provider_call(operation, format!("unrecognized instance state '{}'", name))
    })
}

/// Flatten one SDK instance into an `InstanceDescription`
pub(crate) fn describe_instance(
    operation: &'static str,
    instance: &Instance,
) -> Result<InstanceDescription> {
    let instance_id = instance.instance_id().ok_or_else(|| {
        CloudError::provider_call(operation, "instance without an instance id")
    })?;
    let state = parse_state(
        operation,
        instance
            .state()
            .and_then(|s| s.name())
            .map(|name| name.as_str()),
    )?;

    let mut description = InstanceDescription::new(instance_id, state);
    description.public_ip = non_empty(instance.public_ip_address());
    description.private_ip = non_empty(instance.private_ip_address());
    description.public_dns = non_empty(instance.public_dns_name());
    description.private_dns = non_empty(instance.private_dns_name());
    Ok(description)
}

pub(crate) fn state_change(
    change: &aws_sdk_ec2::types::InstanceStateChange,
) -> Result<InstanceStateChange> {
    const OPERATION: &str = "TerminateInstances";
    let instance_id = change.instance_id().ok_or_else(|| {
        CloudError::provider_call(OPERATION, "state change without an instance id")
    })?;
    Ok(InstanceStateChange {
        instance_id: instance_id.to_string(),
        previous_state: parse_state(
            OPERATION,
            change.previous_state().and_then(|s| s.name()).map(|n| n.as_str()),
        )?,
        current_state: parse_state(
            OPERATION,
            change.current_state().and_then(|s| s.name()).map(|n| n.as_str()),
        )?,
    })
}

/// Map an SDK error, recognizing "no such instance" codes
pub(crate) fn map_sdk_error<E, R>(
    operation: &'static str,
    instance_id: Option<&str>,
    err: SdkError<E, R>,
) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if let (Some(id), Some(code)) = (instance_id, err.code()) {
        if INSTANCE_NOT_FOUND_CODES.contains(&code) {
            return CloudError::InstanceNotFound(id.to_string());
        }
    }
    CloudError::provider_call(operation, DisplayErrorContext(&err).to_string())
}
