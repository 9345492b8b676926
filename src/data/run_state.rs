//! Resumable progress of the current import run and the lock guarding it

use crate::cache::{CacheError, KvStore, KvStoreExt};
use crate::data::import::OutcomeCounters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Progress snapshot saved after every batch that did not finish the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRunState {
    pub cache_key: String,
    /// Offset of the next batch
    pub offset: usize,
    pub total_rows: usize,
    #[serde(flatten)]
    pub counters: OutcomeCounters,
    pub saved_at: DateTime<Utc>,
    /// Latest log lines, oldest first
    #[serde(default)]
    pub log: Vec<String>,
}

impl ImportRunState {
    pub const KEY: &'static str = "import_run_state";
    pub const MAX_LOG_LINES: usize = 100;

    pub fn new(cache_key: &str, total_rows: usize) -> Self {
        Self {
            cache_key: cache_key.to_owned(),
            offset: 0,
            total_rows,
            counters: OutcomeCounters::default(),
            saved_at: Utc::now(),
            log: vec![],
        }
    }

    pub fn load(store: &dyn KvStore) -> Result<Option<Self>, CacheError> {
        store.get_json(Self::KEY)
    }

    pub fn save(&mut self, store: &dyn KvStore, ttl: Duration) -> Result<(), CacheError> {
        self.saved_at = Utc::now();
        store.set_json(Self::KEY, self, Some(ttl))
    }

    pub fn clear(store: &dyn KvStore) -> Result<(), CacheError> {
        store.delete(Self::KEY)
    }

    pub fn push_log<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        self.log.extend(lines);
        if self.log.len() > Self::MAX_LOG_LINES {
            let excess = self.log.len() - Self::MAX_LOG_LINES;
            self.log.drain(..excess);
        }
    }

    /// Percentage of rows handed out to batches so far
    pub fn progress(&self) -> f64 {
        progress_percent(self.offset, self.total_rows)
    }
}

pub fn progress_percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let percent = done.min(total) as f64 / total as f64 * 100.0;
    (percent * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLock {
    pub cache_key: String,
    pub acquired_at: DateTime<Utc>,
}

impl RunLock {
    pub const KEY: &'static str = "import_run_lock";

    pub fn current(store: &dyn KvStore) -> Result<Option<Self>, CacheError> {
        store.get_json(Self::KEY)
    }

    pub fn acquire(store: &dyn KvStore, cache_key: &str, ttl: Duration) -> Result<Self, CacheError> {
        let lock = Self {
            cache_key: cache_key.to_owned(),
            acquired_at: Utc::now(),
        };
        store.set_json(Self::KEY, &lock, Some(ttl))?;
        Ok(lock)
    }

    /// Only releases a lock held for `cache_key`
    pub fn release(store: &dyn KvStore, cache_key: &str) -> Result<(), CacheError> {
        match Self::current(store)? {
            Some(lock) if lock.cache_key == cache_key => store.delete(Self::KEY),
            _ => Ok(()),
        }
    }
}
