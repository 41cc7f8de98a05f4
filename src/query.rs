//! Decoded queries: the permission-checked form handed to storage.

use selector_core::{QuerySelector, SortOption, TValue, UpdateOp};
use std::collections::BTreeMap;

use crate::schema::DEFAULT_KEYS;

/// Default length of generated object ids
pub const DEFAULT_OBJECT_ID_SIZE: usize = 10;

/// Filter, sort and paging applied to one class
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBaseQuery {
    pub filter: QuerySelector,
    pub sort: SortOption,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

/// A fully decoded query against one class.
///
/// `includes` holds every projected path, with pointer and relation
/// sub-paths dotted (`author.name`). `matches` is keyed by the full path of
/// each pointer/relation (`author`, `author.org`) and carries the sub-query
/// applied to that join.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedQuery {
    pub class_name: String,
    pub filter: QuerySelector,
    pub sort: SortOption,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub includes: Vec<String>,
    pub matches: BTreeMap<String, DecodedBaseQuery>,
    pub object_id_size: usize,
}

impl DecodedQuery {
    /// Unfiltered query over the default keys
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            filter: QuerySelector::default(),
            sort: SortOption::default(),
            skip: None,
            limit: None,
            includes: DEFAULT_KEYS.iter().map(|k| k.to_string()).collect(),
            matches: BTreeMap::new(),
            object_id_size: DEFAULT_OBJECT_ID_SIZE,
        }
    }

    pub fn base(&self) -> DecodedBaseQuery {
        DecodedBaseQuery {
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
        }
    }

    /// Projection of this query, used to read back written rows
    pub fn insert_options(&self) -> InsertOptions {
        InsertOptions {
            class_name: self.class_name.clone(),
            includes: self.includes.clone(),
            matches: self.matches.clone(),
            object_id_size: self.object_id_size,
        }
    }
}

/// Target and read-back projection of an insert
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOptions {
    pub class_name: String,
    pub includes: Vec<String>,
    pub matches: BTreeMap<String, DecodedBaseQuery>,
    pub object_id_size: usize,
}

impl InsertOptions {
    /// Read-back query for rows produced by a write
    pub fn as_query(&self) -> DecodedQuery {
        DecodedQuery {
            includes: self.includes.clone(),
            matches: self.matches.clone(),
            object_id_size: self.object_id_size,
            ..DecodedQuery::new(self.class_name.clone())
        }
    }
}

/// Column values of one object to insert, keyed by path
pub type InsertValues = BTreeMap<String, TValue>;

/// Update operators keyed by path, in request order
pub type UpdateSpec = Vec<(String, UpdateOp)>;
