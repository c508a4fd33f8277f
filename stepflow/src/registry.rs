//! Provider registry: model identifier -> provider instance
//!
//! The provider set is closed and registered explicitly at startup.
//! Resolution failure is a configuration bug and is surfaced as a hard
//! error, never a silent no-op.

use std::collections::HashMap;
use std::sync::Arc;

use stepflow_sdk::{Provider, ProviderMetadata};

use crate::error::EngineError;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a provider, overwriting any previous registration with the
    /// same identifier.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.metadata().id, provider);
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Provider>, EngineError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProvider(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    /// Metadata for every registered provider, sorted by identifier
    pub fn metadata_list(&self) -> Vec<ProviderMetadata> {
        let mut list: Vec<ProviderMetadata> =
            self.providers.values().map(|p| p.metadata()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}
