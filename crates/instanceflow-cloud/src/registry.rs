//! Explicit registry of cloud backends
//!
//! Built once at process start and handed to the controller; nothing
//! registers itself globally.

use crate::error::{CloudError, Result};
use crate::provider::CloudClient;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    clients: BTreeMap<String, Arc<dyn CloudClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own `name()`. A later registration with the same name wins.
    pub fn register(&mut self, client: Arc<dyn CloudClient>) -> &mut Self {
        let name = client.name().to_string();
        if self.clients.insert(name.clone(), client).is_some() {
            tracing::warn!(backend = %name, "replacing registered cloud backend");
        }
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CloudClient>> {
        self.clients
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::ProviderNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.clients.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("backends", &self.names())
            .finish()
    }
}
