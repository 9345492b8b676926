//! Definitions for the `profile.yaml` and `.credentials.toml` files
//!
//! Allows deserialization into a proper typed structure from these files
//! or also write these typed structures to a file (in case of `.credentials.toml`)
//!
//! Utilizes https://serde.rs/

use crate::cache::ChunkedCache;
use crate::data::feed::FeedFormat;
use crate::fetch::{SftpTarget, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const CREDENTIALS_FILE: &str = "./.credentials.toml";

/// Default profile written by the `init` command
pub const PROFILE_TEMPLATE: &str = include_str!("resources/profile.yaml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub base_url: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    /// Password of the vendor SFTP account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sftp_password: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SFTP configuration incomplete, missing: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("Invalid delimiter '{0}', expected a single ASCII character")]
    Delimiter(String),
}

#[derive(Debug, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub source: Source,

    #[serde(default)]
    pub import: ImportOptions,

    #[serde(default)]
    pub cache: CacheOptions,

    #[serde(default)]
    pub catalog: CatalogOptions,
}

#[derive(Debug, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    /// Remote file path, relative paths start in the login directory
    #[serde(default)]
    pub path: String,

    #[serde(default = "default_format")]
    pub format: FeedFormat,

    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

impl Default for Source {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            path: String::new(),
            format: default_format(),
            delimiter: default_delimiter(),
        }
    }
}

impl Source {
    /// Check the whole SFTP block at once, so the error names every missing field
    pub fn sftp_target(&self, credentials: &Credentials) -> Result<SftpTarget, ConfigError> {
        let password = credentials.sftp_password.as_deref().unwrap_or_default();

        let missing: Vec<&'static str> = [
            ("host", self.host.as_str()),
            ("username", self.username.as_str()),
            ("password", password),
            ("path", self.path.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        Ok(SftpTarget {
            host: self.host.trim().to_owned(),
            port: self.port,
            username: self.username.trim().to_owned(),
            password: password.to_owned(),
            path: self.path.trim().to_owned(),
        })
    }

    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        match self.delimiter.as_bytes() {
            [byte] if byte.is_ascii() => Ok(*byte),
            b"\\t" => Ok(b'\t'),
            _ => Err(ConfigError::Delimiter(self.delimiter.clone())),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ImportOptions {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_true")]
    pub validate_images: bool,

    #[serde(default = "Vec::new")]
    pub hidden_categories: Vec<String>,

    #[serde(default = "default_category_column")]
    pub category_column: String,

    /// How many image probes run at the same time
    #[serde(default = "default_probe_threads")]
    pub probe_threads: usize,

    #[serde(default = "String::new")]
    pub row_script: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            validate_images: true,
            hidden_categories: vec![],
            category_column: default_category_column(),
            probe_threads: default_probe_threads(),
            row_script: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheOptions {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Feeds serializing to more bytes than this are cached in chunks
    #[serde(default = "default_chunk_threshold_bytes")]
    pub chunk_threshold_bytes: usize,

    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_hours: default_ttl_hours(),
            chunk_threshold_bytes: default_chunk_threshold_bytes(),
            chunk_rows: default_chunk_rows(),
        }
    }
}

impl CacheOptions {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.max(1) * 60 * 60)
    }
}

#[derive(Debug, Deserialize)]
pub struct CatalogOptions {
    #[serde(default = "default_entity")]
    pub entity: String,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            entity: default_entity(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_format() -> FeedFormat {
    FeedFormat::Csv
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_batch_size() -> usize {
    25
}

fn default_true() -> bool {
    true
}

fn default_category_column() -> String {
    "Brand".to_string()
}

fn default_probe_threads() -> usize {
    8
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".feed-sync")
}

fn default_ttl_hours() -> u64 {
    6
}

fn default_chunk_threshold_bytes() -> usize {
    ChunkedCache::THRESHOLD_BYTES
}

fn default_chunk_rows() -> usize {
    ChunkedCache::CHUNK_SIZE
}

fn default_entity() -> String {
    "hp_wheel".to_string()
}
