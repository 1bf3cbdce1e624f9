//! Cloud backends compiled into this binary

use instanceflow_cloud::{FakeCloud, ProviderRegistry};
use std::sync::Arc;

pub fn build_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(FakeCloud::new()));

    #[cfg(feature = "aws-cloud")]
    registry.register(Arc::new(instanceflow_cloud_aws::Ec2CloudClient::new()));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_backend_always_available() {
        let registry = build_registry();
        assert!(registry.get("fake").is_ok());
    }

    #[cfg(feature = "aws-cloud")]
    #[test]
    fn test_aws_backend_registered() {
        let registry = build_registry();
        assert_eq!(registry.names(), vec!["aws", "fake"]);
    }
}
