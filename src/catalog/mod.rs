//! Interface of the catalog the feed is reconciled against
//!
//! The catalog itself is owned by another system. This module only describes
//! what the import needs from it: a keyed record store with a lifecycle status,
//! scalar attributes and categorical tags.

#[cfg(test)]
pub mod memory;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub type RecordId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Inactive,
}

/// Tag groups used for filtering in the storefront
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    StyleGroup,
    Brand,
    Finish,
}

/// Patch applied to a record.
///
/// Attributes not listed are left untouched. A listed tag replaces every tag
/// of that kind on the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordWrite {
    pub business_key: String,
    pub status: RecordStatus,
    pub attributes: BTreeMap<String, String>,
    pub tags: BTreeMap<TagKind, String>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Api(#[from] crate::api::ApiError),
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("write rejected: {0}")]
    Rejected(String),
}

pub trait CatalogStore: Send + Sync {
    /// `(business_key, id)` of every record in one of `statuses` whose key is not empty
    fn scan_keys(&self, statuses: &[RecordStatus]) -> Result<Vec<(String, RecordId)>, CatalogError>;

    fn create(&self, write: &RecordWrite) -> Result<RecordId, CatalogError>;

    fn update(&self, id: &RecordId, write: &RecordWrite) -> Result<(), CatalogError>;

    fn set_status(&self, id: &RecordId, status: RecordStatus) -> Result<(), CatalogError>;
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Active => f.write_str("active"),
            RecordStatus::Inactive => f.write_str("inactive"),
        }
    }
}
