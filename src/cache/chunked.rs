//! Caching of a parsed feed under one logical key
//!
//! Small datasets are stored as a single entry under `key`. Once the
//! serialized dataset grows past the size threshold the rows are split into
//! fixed-size chunks: metadata goes to `<key>_meta` and every chunk to
//! `<key>_chunk_<n>`. Reads only touch the chunks overlapping the requested
//! window.

use crate::cache::{CacheError, KvStore, KvStoreExt};
use crate::data::RawRow;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
struct CachedDataset {
    header: Vec<String>,
    total_rows: usize,
    downloaded_at: DateTime<Utc>,
    rows: Vec<RawRow>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkMeta {
    header: Vec<String>,
    total_rows: usize,
    downloaded_at: DateTime<Utc>,
    chunk_size: usize,
    chunk_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLayout {
    Inline,
    Chunked { chunk_count: usize },
}

#[derive(Debug)]
pub struct DatasetWindow {
    pub header: Vec<String>,
    pub rows: Vec<RawRow>,
    pub is_chunked: bool,
    pub total_rows: usize,
    pub downloaded_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ChunkedCache {
    store: Arc<dyn KvStore>,
    threshold_bytes: usize,
    chunk_size: usize,
    ttl: Duration,
}

impl ChunkedCache {
    /// Default size above which a dataset is chunked
    pub const THRESHOLD_BYTES: usize = 1024 * 1024;
    pub const CHUNK_SIZE: usize = 1000;

    /// Datasets serializing to more than `threshold_bytes` are stored as chunks of `chunk_size` rows
    pub fn with_limits(
        store: Arc<dyn KvStore>,
        ttl: Duration,
        threshold_bytes: usize,
        chunk_size: usize,
    ) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            store,
            threshold_bytes,
            chunk_size,
            ttl,
        }
    }

    fn meta_key(key: &str) -> String {
        format!("{key}_meta")
    }

    fn chunk_key(key: &str, index: usize) -> String {
        format!("{key}_chunk_{index}")
    }

    pub fn store(
        &self,
        key: &str,
        header: Vec<String>,
        rows: Vec<RawRow>,
        total_rows: usize,
    ) -> Result<StoreLayout, CacheError> {
        let dataset = CachedDataset {
            header,
            total_rows,
            downloaded_at: Utc::now(),
            rows,
        };
        let value = serde_json::to_value(&dataset)?;
        let serialized_size = serde_json::to_vec(&value)?.len();
        debug!(key, serialized_size, "serialized feed for caching");

        if serialized_size <= self.threshold_bytes {
            self.store.set(key, value, Some(self.ttl))?;
            info!(key, total_rows, "feed small enough, stored as single cache entry");
            return Ok(StoreLayout::Inline);
        }
        drop(value);

        let CachedDataset {
            header,
            total_rows,
            downloaded_at,
            rows,
        } = dataset;

        let mut chunk_count = 0;
        for (index, chunk) in rows.into_iter().chunks(self.chunk_size).into_iter().enumerate() {
            let chunk: Vec<RawRow> = chunk.collect();
            debug!(key, index, rows = chunk.len(), "storing chunk");
            self.store
                .set_json(&Self::chunk_key(key, index), &chunk, Some(self.ttl))?;
            chunk_count += 1;
        }

        // metadata last: a reader never sees metadata pointing to missing chunks of a fresh store
        let meta = ChunkMeta {
            header,
            total_rows,
            downloaded_at,
            chunk_size: self.chunk_size,
            chunk_count,
        };
        self.store
            .set_json(&Self::meta_key(key), &meta, Some(self.ttl))?;

        info!(key, total_rows, chunk_count, serialized_size, "feed too large, stored in chunks");
        Ok(StoreLayout::Chunked { chunk_count })
    }

    /// Whether anything is stored under `key`
    pub fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.store.get(key)?.is_some() || self.store.get(&Self::meta_key(key))?.is_some())
    }

    /// Rows `offset..offset + limit` (clamped to the dataset).
    ///
    /// A missing entry or chunk is [`CacheError::Expired`], never an empty window.
    pub fn read_window(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<DatasetWindow, CacheError> {
        if let Some(dataset) = self.store.get_json::<CachedDataset>(key)? {
            let start = offset.min(dataset.rows.len());
            let end = offset.saturating_add(limit).min(dataset.rows.len());
            let mut rows = dataset.rows;
            let rows: Vec<RawRow> = rows.drain(start..end).collect();

            return Ok(DatasetWindow {
                header: dataset.header,
                rows,
                is_chunked: false,
                total_rows: dataset.total_rows,
                downloaded_at: dataset.downloaded_at,
            });
        }

        let Some(meta) = self.store.get_json::<ChunkMeta>(&Self::meta_key(key))? else {
            return Err(CacheError::Expired(key.to_owned()));
        };

        let mut rows = vec![];
        if limit > 0 && offset < meta.total_rows && meta.chunk_count > 0 {
            let start_chunk = offset / meta.chunk_size;
            let end_chunk =
                ((offset + limit - 1) / meta.chunk_size).min(meta.chunk_count - 1);
            debug!(key, offset, start_chunk, end_chunk, "loading chunks for window");

            let mut loaded: Vec<RawRow> = vec![];
            for index in start_chunk..=end_chunk {
                let chunk_key = Self::chunk_key(key, index);
                let Some(chunk) = self.store.get_json::<Vec<RawRow>>(&chunk_key)? else {
                    return Err(CacheError::Expired(chunk_key));
                };
                loaded.extend(chunk);
            }

            let skip = offset - start_chunk * meta.chunk_size;
            rows = loaded.into_iter().skip(skip).take(limit).collect();
        }

        Ok(DatasetWindow {
            header: meta.header,
            rows,
            is_chunked: true,
            total_rows: meta.total_rows,
            downloaded_at: meta.downloaded_at,
        })
    }

    /// Delete the dataset and all of its chunks
    pub fn purge(&self, key: &str) -> Result<(), CacheError> {
        if self.store.get(key)?.is_some() {
            self.store.delete(key)?;
            debug!(key, "removed single cache entry");
            return Ok(());
        }

        let meta_key = Self::meta_key(key);
        if let Some(meta) = self.store.get_json::<ChunkMeta>(&meta_key)? {
            for index in 0..meta.chunk_count {
                self.store.delete(&Self::chunk_key(key, index))?;
            }
            self.store.delete(&meta_key)?;
            debug!(key, chunk_count = meta.chunk_count, "removed chunked cache entries");
        }

        Ok(())
    }
}
