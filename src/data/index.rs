//! Business key -> record id lookup for one import run

use crate::cache::{CacheError, KvStore, KvStoreExt};
use crate::catalog::{CatalogError, CatalogStore, RecordId, RecordStatus};
use crate::data::row::clean_text;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExistingRecordIndex {
    entries: HashMap<String, RecordId>,
}

impl ExistingRecordIndex {
    /// Lifetime of the cached index, longer than any sane run
    pub const TTL: Duration = Duration::from_secs(2 * 60 * 60);

    /// One scan over active and inactive records, so a previously deactivated
    /// item is updated instead of duplicated.
    pub fn build(catalog: &dyn CatalogStore) -> Result<Self, CatalogError> {
        let keys = catalog.scan_keys(&[RecordStatus::Active, RecordStatus::Inactive])?;

        let mut entries = HashMap::with_capacity(keys.len());
        for (business_key, id) in keys {
            let business_key = clean_text(&business_key);
            if business_key.is_empty() {
                continue;
            }
            if let Some(kept) = entries.get(&business_key) {
                warn!(%business_key, kept_id = %kept, ignored_id = %id, "duplicate business key in catalog");
                continue;
            }
            entries.insert(business_key, id);
        }

        info!(records = entries.len(), "built existing record index");
        Ok(Self { entries })
    }

    pub fn storage_key(cache_key: &str) -> String {
        format!("{cache_key}_existing")
    }

    pub fn load(store: &dyn KvStore, cache_key: &str) -> Result<Option<Self>, CacheError> {
        store.get_json(&Self::storage_key(cache_key))
    }

    pub fn save(&self, store: &dyn KvStore, cache_key: &str) -> Result<(), CacheError> {
        store.set_json(&Self::storage_key(cache_key), self, Some(Self::TTL))
    }

    pub fn get(&self, business_key: &str) -> Option<&RecordId> {
        self.entries.get(business_key)
    }

    pub fn insert(&mut self, business_key: &str, id: RecordId) {
        self.entries.insert(business_key.to_owned(), id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
