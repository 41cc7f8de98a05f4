//! Raw, untrusted request shapes.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{DbError, DbResult};

/// Filter, sort and paging for one populated pointer or relation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawMatch {
    #[serde(default)]
    pub filter: Value,
    #[serde(default)]
    pub sort: Value,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    /// Nested matches, keyed relative to this populate
    #[serde(default)]
    pub matches: BTreeMap<String, RawMatch>,
}

/// `find`, `count`, `explain`, `updateOne`, `upsertOne`, `deleteOne` and
/// `deleteMany` options
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawQuery {
    pub class_name: String,
    #[serde(default)]
    pub filter: Value,
    #[serde(default)]
    pub sort: Value,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub matches: BTreeMap<String, RawMatch>,
}

/// `insert` options: target class and read-back projection
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawInsertOptions {
    pub class_name: String,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub matches: BTreeMap<String, RawMatch>,
}

impl RawInsertOptions {
    pub fn into_query(self) -> RawQuery {
        RawQuery {
            class_name: self.class_name,
            includes: self.includes,
            matches: self.matches,
            ..Default::default()
        }
    }
}

/// Deserialize a request, reporting shape errors as `InvalidExpression`
pub fn parse<T: serde::de::DeserializeOwned>(value: Value) -> DbResult<T> {
    serde_json::from_value(value).map_err(|e| DbError::InvalidExpression(e.to_string()))
}
