//! Typed representation of a single feed row

use std::collections::BTreeMap;

/// Columns of the vendor feed that map onto catalog attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    PartNumber,
    PartDescription,
    DisplayStyleNo,
    Brand,
    Finish,
    Size,
    BoltPattern,
    Offset,
    CenterBore,
    LoadRating,
    ShippingWeight,
    ImageUrl,
    InvOrderType,
    Style,
    TotalQoh,
    MsrpUsd,
    MapUsd,
    RunDate,
}

impl Column {
    pub const ALL: [Column; 18] = [
        Column::PartNumber,
        Column::PartDescription,
        Column::DisplayStyleNo,
        Column::Brand,
        Column::Finish,
        Column::Size,
        Column::BoltPattern,
        Column::Offset,
        Column::CenterBore,
        Column::LoadRating,
        Column::ShippingWeight,
        Column::ImageUrl,
        Column::InvOrderType,
        Column::Style,
        Column::TotalQoh,
        Column::MsrpUsd,
        Column::MapUsd,
        Column::RunDate,
    ];

    /// Column name as it appears in the feed header
    pub fn header_name(self) -> &'static str {
        match self {
            Column::PartNumber => "PartNumber",
            Column::PartDescription => "PartDescription",
            Column::DisplayStyleNo => "DisplayStyleNo",
            Column::Brand => "Brand",
            Column::Finish => "Finish",
            Column::Size => "Size",
            Column::BoltPattern => "BoltPattern",
            Column::Offset => "Offset",
            Column::CenterBore => "CenterBore",
            Column::LoadRating => "LoadRating",
            Column::ShippingWeight => "ShippingWeight",
            Column::ImageUrl => "ImageURL",
            Column::InvOrderType => "InvOrderType",
            Column::Style => "Style",
            Column::TotalQoh => "TotalQOH",
            Column::MsrpUsd => "MSRP_USD",
            Column::MapUsd => "MAP_USD",
            Column::RunDate => "RunDate",
        }
    }

    /// Attribute name used on the catalog record
    pub fn attribute_key(self) -> &'static str {
        match self {
            Column::PartNumber => "part_number",
            Column::PartDescription => "part_description",
            Column::DisplayStyleNo => "display_style_no",
            Column::Brand => "brand",
            Column::Finish => "finish",
            Column::Size => "size",
            Column::BoltPattern => "bolt_pattern",
            Column::Offset => "offset",
            Column::CenterBore => "center_bore",
            Column::LoadRating => "load_rating",
            Column::ShippingWeight => "shipping_weight",
            Column::ImageUrl => "image_url",
            Column::InvOrderType => "inventory_order_type",
            Column::Style => "style",
            Column::TotalQoh => "total_qoh",
            Column::MsrpUsd => "msrp_usd",
            Column::MapUsd => "map_usd",
            Column::RunDate => "run_date",
        }
    }

    pub fn from_header(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|column| column.header_name() == name)
    }
}

/// One source line, keyed by column.
///
/// Known columns are addressed through [`Column`], anything else the vendor
/// adds to the feed ends up in `extra` so schema drift does not break the import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedRow {
    known: BTreeMap<Column, String>,
    extra: BTreeMap<String, String>,
}

impl FeedRow {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut row = FeedRow::default();
        for (name, value) in pairs {
            row.insert(name.as_ref(), value.into());
        }
        row
    }

    pub fn insert(&mut self, name: &str, value: String) {
        match Column::from_header(name) {
            Some(column) => {
                self.known.insert(column, value);
            }
            None => {
                self.extra.insert(name.to_owned(), value);
            }
        }
    }

    pub fn get(&self, column: Column) -> Option<&str> {
        self.known.get(&column).map(String::as_str)
    }

    /// Lookup by header name, covering known and unknown columns
    pub fn value_of(&self, name: &str) -> Option<&str> {
        match Column::from_header(name) {
            Some(column) => self.get(column),
            None => self.extra.get(name).map(String::as_str),
        }
    }

    /// Non-blank part number in its stored form, see [`clean_text`]
    pub fn business_key(&self) -> Option<String> {
        self.get(Column::PartNumber)
            .map(clean_text)
            .filter(|key| !key.is_empty())
    }

    pub fn known(&self) -> impl Iterator<Item = (Column, &str)> {
        self.known.iter().map(|(c, v)| (*c, v.as_str()))
    }

    /// All columns keyed by header name
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        for (column, value) in &self.known {
            map.insert(column.header_name().to_owned(), value.clone());
        }
        map
    }
}

/// Single line of plain text: control characters dropped, whitespace collapsed.
///
/// Business keys go through this before they are written, looked up or
/// compared, so catalog and feed always agree on their form.
pub fn clean_text(value: &str) -> String {
    value
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
