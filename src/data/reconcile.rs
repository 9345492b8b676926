//! Turning a validated row into a catalog write

use crate::catalog::{CatalogError, CatalogStore, RecordId, RecordStatus, RecordWrite, TagKind};
use crate::data::index::ExistingRecordIndex;
use crate::data::row::{clean_text, Column, FeedRow};
use crate::data::validate::parse_image_url;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created(RecordId),
    Updated(RecordId),
}

/// Columns backing a categorical tag
const TAG_COLUMNS: [(Column, TagKind); 3] = [
    (Column::DisplayStyleNo, TagKind::StyleGroup),
    (Column::Brand, TagKind::Brand),
    (Column::Finish, TagKind::Finish),
];

pub struct Reconciler<'a> {
    catalog: &'a dyn CatalogStore,
}

impl<'a> Reconciler<'a> {
    pub fn new(catalog: &'a dyn CatalogStore) -> Self {
        Self { catalog }
    }

    /// Create or update the record for `row`.
    ///
    /// The row must carry a business key, which [`crate::data::validate::RowValidator`] ensures.
    pub fn reconcile(
        &self,
        row: &FeedRow,
        index: &mut ExistingRecordIndex,
    ) -> Result<Outcome, CatalogError> {
        let write = record_write(row)?;

        match index.get(&write.business_key) {
            Some(id) => {
                let id = id.clone();
                self.catalog.update(&id, &write)?;
                debug!(business_key = %write.business_key, %id, "updated record");
                Ok(Outcome::Updated(id))
            }
            None => {
                let id = self.catalog.create(&write)?;
                index.insert(&write.business_key, id.clone());
                debug!(business_key = %write.business_key, %id, "created record");
                Ok(Outcome::Created(id))
            }
        }
    }
}

/// Patch for `row`: columns present in the row overwrite, absent ones are left alone
pub fn record_write(row: &FeedRow) -> Result<RecordWrite, CatalogError> {
    let business_key = row
        .business_key()
        .ok_or_else(|| CatalogError::Rejected("row has no part number".to_string()))?;

    let mut attributes = BTreeMap::new();
    for (column, value) in row.known() {
        let value = match column {
            Column::PartNumber => continue,
            Column::ImageUrl => parse_image_url(value)
                .map(String::from)
                .unwrap_or_default(),
            _ => clean_text(value),
        };
        attributes.insert(column.attribute_key().to_owned(), value);
    }
    attributes.insert(
        Column::PartNumber.attribute_key().to_owned(),
        business_key.clone(),
    );

    let mut tags = BTreeMap::new();
    for (column, kind) in TAG_COLUMNS {
        let value = row.get(column).map(clean_text).unwrap_or_default();
        if !value.is_empty() {
            tags.insert(kind, value);
        }
    }

    Ok(RecordWrite {
        business_key,
        status: RecordStatus::Active,
        attributes,
        tags,
    })
}
