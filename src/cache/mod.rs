//! Key-value storage with expiry
//!
//! Backs the feed cache, the existing-record index, the batch ledger and the
//! resumable run state. Every entry can carry a time to live so an abandoned
//! import cleans up after itself.

mod chunked;
mod file;
#[cfg(test)]
pub mod memory;

pub use chunked::{ChunkedCache, DatasetWindow, StoreLayout};
pub use file::FileKvStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache expired or not found ({0}). Please fetch the feed again.")]
    Expired(String),
    #[error("Cache I/O error on '{0}': {1}")]
    Io(String, #[source] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid cache key '{0}'")]
    InvalidKey(String),
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError>;

    /// `ttl` of `None` keeps the entry until it is deleted
    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every expired entry, returns how many were removed
    fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

/// Typed access on top of any [`KvStore`]
pub trait KvStoreExt {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError>;

    fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;
}

impl<S: KvStore + ?Sized> KvStoreExt for S {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.set(key, serde_json::to_value(value)?, ttl)
    }
}

pub fn validate_key(key: &str) -> Result<(), CacheError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(key.to_owned()))
    }
}
