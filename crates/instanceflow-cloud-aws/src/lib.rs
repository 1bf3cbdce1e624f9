//! AWS EC2 backend for InstanceFlow
//!
//! Implements `CloudClient` on top of `aws-sdk-ec2`. Credentials come from
//! the standard AWS provider chain (environment, profile, IMDS); the region
//! comes from each declarative record.

pub mod client;
mod convert;

pub use client::Ec2CloudClient;
