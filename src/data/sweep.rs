//! Soft-deletes records that disappeared from the feed

use crate::catalog::{CatalogError, CatalogStore, RecordStatus};
use crate::data::row::clean_text;
use std::collections::HashSet;
use tracing::{info, warn};

pub struct DeactivationSweep<'a> {
    catalog: &'a dyn CatalogStore,
}

impl<'a> DeactivationSweep<'a> {
    pub fn new(catalog: &'a dyn CatalogStore) -> Self {
        Self { catalog }
    }

    /// Flip every active record whose key is not in `processed_keys` to inactive.
    ///
    /// Returns the number of records flipped. A record that vanished between
    /// scan and write is skipped, any other write error aborts the sweep.
    pub fn sweep(&self, processed_keys: &HashSet<String>) -> Result<usize, CatalogError> {
        let active = self.catalog.scan_keys(&[RecordStatus::Active])?;
        let mut deactivated = 0;

        for (business_key, id) in active {
            if processed_keys.contains(&clean_text(&business_key)) {
                continue;
            }

            match self.catalog.set_status(&id, RecordStatus::Inactive) {
                Ok(()) => deactivated += 1,
                Err(CatalogError::NotFound(id)) => {
                    warn!(%business_key, %id, "record disappeared before it could be deactivated");
                }
                Err(e) => return Err(e),
            }
        }

        info!(deactivated, processed = processed_keys.len(), "deactivation sweep finished");
        Ok(deactivated)
    }
}
