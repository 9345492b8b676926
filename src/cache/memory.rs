//! In-process store used by the tests

use crate::cache::{validate_key, CacheError, KvStore};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, (serde_json::Value, Option<Instant>)>>,
    reads: Mutex<Vec<String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key passed to `get`, in call order
    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }

    pub fn clear_reads(&self) {
        self.reads.lock().unwrap().clear();
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop an entry as if its time to live ran out
    pub fn expire(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        validate_key(key)?;
        self.reads.lock().unwrap().push(key.to_owned());

        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        validate_key(key)?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value, expires_at));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
