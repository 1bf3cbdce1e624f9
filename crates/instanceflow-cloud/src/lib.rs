//! InstanceFlow Cloud Abstraction
//!
//! This crate defines the compute capability set the InstanceFlow controller
//! needs from a cloud: launch one instance, describe it, terminate it.
//!
//! # Backends
//!
//! - **AWS EC2**: `instanceflow-cloud-aws` (via aws-sdk-ec2)
//! - **Fake**: in-process, scripted state machine (`fake` feature)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              instanceflow-controlplane           │
//! │        (reconciler / provisioner / terminator)   │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               instanceflow-cloud                 │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait CloudClient { create / describe / │   │
//! │  │                      terminate }          │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────────┐  ┌──────────────┐         │
//! │  │ ProviderRegistry │  │ RetryConfig  │         │
//! │  └──────────────────┘  └──────────────┘         │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │    aws ec2    │ │   FakeCloud   │
//! └───────────────┘ └───────────────┘
//! ```

pub mod error;
pub mod instance;
pub mod provider;
pub mod registry;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

// Re-exports
pub use error::{CloudError, Result};
pub use instance::{
    BlockDevice, CreateInstancesRequest, InstanceDescription, InstanceState, InstanceStateChange,
};
pub use provider::{CloudClient, RetryConfig};
pub use registry::ProviderRegistry;

#[cfg(any(test, feature = "fake"))]
pub use fake::{CallCounts, FakeCloud};
