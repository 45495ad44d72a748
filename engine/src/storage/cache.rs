use std::sync::Arc;

use dashmap::DashMap;

use super::store::RecordStore;

/// Process-wide registry of record stores by path tag, shared between the
/// train service (which creates stores) and the rule publisher (which reads
/// sequences back by index). Lookup-only aliasing: nothing writes through
/// the cache.
#[derive(Debug, Clone, Default)]
pub struct StoreCache {
    stores: Arc<DashMap<String, Arc<RecordStore>>>,
}

impl StoreCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RecordStore>> {
        self.stores.get(name).map(|entry| entry.value().clone())
    }

    pub fn put(&self, name: String, store: Arc<RecordStore>) {
        self.stores.insert(name, store);
    }
}
