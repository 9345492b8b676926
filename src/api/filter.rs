//! Data structures to build search criteria for the catalog API

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct Criteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "skip_page_serialize")]
    pub page: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<CriteriaFilter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<CriteriaSorting>,
    /// Restrict the returned attributes, keeps search responses small
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

fn skip_page_serialize(page: &u64) -> bool {
    *page == 1
}

impl Default for Criteria {
    fn default() -> Self {
        Self {
            limit: None,
            page: 1,
            filter: vec![],
            sort: vec![],
            fields: vec![],
        }
    }
}

impl Criteria {
    /// Maximum limit accepted by the API server
    pub const MAX_LIMIT: usize = 500;

    pub fn add_filter(&mut self, filter: CriteriaFilter) -> &mut Self {
        self.filter.push(filter);
        self
    }

    pub fn add_sorting(&mut self, sorting: CriteriaSorting) -> &mut Self {
        self.sort.push(sorting);
        self
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CriteriaSorting {
    pub field: String,
    pub order: CriteriaSortingOrder,
}

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub enum CriteriaSortingOrder {
    #[serde(rename = "ASC")]
    Ascending,
    #[serde(rename = "DESC")]
    Descending,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CriteriaFilter {
    Equals {
        field: String,
        value: serde_json::Value,
    },
    EqualsAny {
        field: String,
        value: Vec<serde_json::Value>,
    },
    Not {
        /// operator used WITHIN the not filter (between all queries)
        operator: LogicOperator,
        queries: Vec<CriteriaFilter>,
    },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicOperator {
    And,
    Or,
}
