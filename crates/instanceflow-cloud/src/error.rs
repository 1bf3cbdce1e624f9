//! Cloud provider error types

use thiserror::Error;

/// Cloud provider errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// The create/describe/terminate call itself failed (network, auth, quota, validation)
    #[error("{operation} failed: {message}")]
    ProviderCall {
        operation: &'static str,
        message: String,
    },

    /// The provider does not know the instance (yet, or any more)
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl CloudError {
    pub fn provider_call(operation: &'static str, message: impl Into<String>) -> Self {
        Self::ProviderCall {
            operation,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
