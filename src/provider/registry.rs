use std::collections::HashMap;
use std::sync::Arc;

use super::ProviderClient;

/// Provider clients keyed by provider id.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.id().to_string(), client);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}
