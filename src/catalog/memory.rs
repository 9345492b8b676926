//! In-process catalog used by the tests

use crate::catalog::{CatalogError, CatalogStore, RecordId, RecordStatus, RecordWrite, TagKind};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub business_key: String,
    pub status: RecordStatus,
    pub attributes: BTreeMap<String, String>,
    pub tags: BTreeMap<TagKind, String>,
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: Mutex<Vec<StoredRecord>>,
    rejected_keys: Mutex<HashSet<String>>,
    writes: Mutex<usize>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing the import
    pub fn insert(&self, business_key: &str, status: RecordStatus) -> RecordId {
        let mut records = self.records.lock().unwrap();
        let id = format!("rec-{}", records.len() + 1);
        let mut attributes = BTreeMap::new();
        attributes.insert("part_number".to_owned(), business_key.to_owned());
        records.push(StoredRecord {
            id: id.clone(),
            business_key: business_key.to_owned(),
            status,
            attributes,
            tags: BTreeMap::new(),
        });
        id
    }

    /// Make every create for `business_key` fail
    pub fn reject_creates_for(&self, business_key: &str) {
        self.rejected_keys
            .lock()
            .unwrap()
            .insert(business_key.to_owned());
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn by_key(&self, business_key: &str) -> Vec<StoredRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.business_key == business_key)
            .collect()
    }

    pub fn count_with_status(&self, status: RecordStatus) -> usize {
        self.records().iter().filter(|r| r.status == status).count()
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

fn apply(record: &mut StoredRecord, write: &RecordWrite) {
    record.business_key = write.business_key.clone();
    record.status = write.status;
    for (key, value) in &write.attributes {
        record.attributes.insert(key.clone(), value.clone());
    }
    for (kind, value) in &write.tags {
        record.tags.insert(*kind, value.clone());
    }
}

impl CatalogStore for MemoryCatalog {
    fn scan_keys(&self, statuses: &[RecordStatus]) -> Result<Vec<(String, RecordId)>, CatalogError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| statuses.contains(&r.status) && !r.business_key.is_empty())
            .map(|r| (r.business_key.clone(), r.id.clone()))
            .collect())
    }

    fn create(&self, write: &RecordWrite) -> Result<RecordId, CatalogError> {
        if self
            .rejected_keys
            .lock()
            .unwrap()
            .contains(&write.business_key)
        {
            return Err(CatalogError::Rejected(format!(
                "duplicate or invalid record {}",
                write.business_key
            )));
        }

        *self.writes.lock().unwrap() += 1;
        let mut records = self.records.lock().unwrap();
        let id = format!("rec-{}", records.len() + 1);
        let mut record = StoredRecord {
            id: id.clone(),
            business_key: String::new(),
            status: RecordStatus::Active,
            attributes: BTreeMap::new(),
            tags: BTreeMap::new(),
        };
        apply(&mut record, write);
        records.push(record);
        Ok(id)
    }

    fn update(&self, id: &RecordId, write: &RecordWrite) -> Result<(), CatalogError> {
        *self.writes.lock().unwrap() += 1;
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.clone()))?;
        apply(record, write);
        Ok(())
    }

    fn set_status(&self, id: &RecordId, status: RecordStatus) -> Result<(), CatalogError> {
        *self.writes.lock().unwrap() += 1;
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.clone()))?;
        record.status = status;
        Ok(())
    }
}
