//! Turns raw requests into permission-checked decoded queries.
//!
//! A [`QueryDecoder`] is a pure function of the schema, the caller and the
//! request. Every path a query touches (filter, sort, includes and the
//! filters of its matches) is validated before anything is returned.

use chrono::{DateTime, Utc};
use selector_core::{QuerySelector, SortOption, TValue, UpdateOp};
use serde_json::Value;
use std::collections::BTreeMap;

use super::filter::{is_get_method, PermissionColumn};
use super::keys::push_unique;
use super::request::{RawInsertOptions, RawMatch, RawQuery};
use super::CallerIdentity;
use crate::error::{DbError, DbResult};
use crate::query::{DecodedBaseQuery, DecodedQuery, InsertOptions, InsertValues, UpdateSpec, DEFAULT_OBJECT_ID_SIZE};
use crate::schema::{ClassAction, DataType, FieldAction, SchemaMap};

pub struct QueryDecoder<'a> {
    pub(super) schema: &'a SchemaMap,
    pub(super) identity: &'a CallerIdentity,
    /// Row ACL subjects of the caller, always including `*`
    pub(super) acls: Vec<String>,
    pub(super) now: DateTime<Utc>,
    object_id_size: usize,
}

/// Caller filter before row permissions were added
struct Decoded {
    query: DecodedQuery,
    caller_filter: QuerySelector,
}

impl<'a> QueryDecoder<'a> {
    pub fn new(schema: &'a SchemaMap, identity: &'a CallerIdentity) -> Self {
        Self {
            schema,
            identity,
            acls: identity.acl_subjects(),
            now: Utc::now(),
            object_id_size: DEFAULT_OBJECT_ID_SIZE,
        }
    }

    /// Reference time for the not-expired predicate
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn with_object_id_size(mut self, size: usize) -> Self {
        self.object_id_size = size;
        self
    }

    fn check_class(&self, class_name: &str, action: ClassAction) -> DbResult<()> {
        if self.identity.is_master || self.schema.get(class_name)?.allows_class(action, &self.acls) {
            Ok(())
        } else {
            Err(DbError::NoPermission)
        }
    }

    fn check_read(&self, decoded: &Decoded) -> DbResult<()> {
        let action = if is_get_method(&decoded.caller_filter) {
            ClassAction::Get
        } else {
            ClassAction::Find
        };
        self.check_class(&decoded.query.class_name, action)
    }

    pub fn find(&self, raw: RawQuery) -> DbResult<DecodedQuery> {
        let decoded = self.decode_query(raw, PermissionColumn::Read)?;
        self.check_read(&decoded)?;
        Ok(decoded.query)
    }

    pub fn explain(&self, raw: RawQuery) -> DbResult<DecodedQuery> {
        self.find(raw)
    }

    pub fn count(&self, raw: RawQuery) -> DbResult<DecodedQuery> {
        let decoded = self.decode_query(raw, PermissionColumn::Read)?;
        self.check_class(&decoded.query.class_name, ClassAction::Count)?;
        Ok(decoded.query)
    }

    pub fn insert(
        &self,
        options: RawInsertOptions,
        values: &[Value],
    ) -> DbResult<(InsertOptions, Vec<InsertValues>)> {
        let decoded = self.decode_query(options.into_query(), PermissionColumn::Read)?;
        let class_name = &decoded.query.class_name;
        self.check_class(class_name, ClassAction::Create)?;
        let values = values
            .iter()
            .map(|value| self.decode_values(class_name, value))
            .collect::<DbResult<Vec<_>>>()?;
        Ok((decoded.query.insert_options(), values))
    }

    pub fn update_one(&self, raw: RawQuery, update: &Value) -> DbResult<(DecodedQuery, UpdateSpec)> {
        let decoded = self.decode_query(raw, PermissionColumn::Write)?;
        let class_name = &decoded.query.class_name;
        self.check_class(class_name, ClassAction::Update)?;
        let update = self.decode_update(class_name, update, &[FieldAction::Update])?;
        Ok((decoded.query, update))
    }

    /// Both `create` and `update` apply: the `$set` values may be inserted.
    pub fn upsert_one(
        &self,
        raw: RawQuery,
        update: &Value,
        set_on_insert: &Value,
    ) -> DbResult<(DecodedQuery, UpdateSpec, InsertValues)> {
        let decoded = self.decode_query(raw, PermissionColumn::Write)?;
        let class_name = &decoded.query.class_name;
        self.check_class(class_name, ClassAction::Create)?;
        self.check_class(class_name, ClassAction::Update)?;
        let update = self.decode_update(
            class_name,
            update,
            &[FieldAction::Update, FieldAction::Create],
        )?;
        let set_on_insert = match set_on_insert {
            Value::Null => InsertValues::new(),
            value => self.decode_values(class_name, value)?,
        };
        Ok((decoded.query, update, set_on_insert))
    }

    pub fn delete_one(&self, raw: RawQuery) -> DbResult<DecodedQuery> {
        let decoded = self.decode_query(raw, PermissionColumn::Write)?;
        self.check_class(&decoded.query.class_name, ClassAction::Delete)?;
        Ok(decoded.query)
    }

    pub fn delete_many(&self, raw: RawQuery) -> DbResult<DecodedQuery> {
        self.delete_one(raw)
    }

    fn decode_values(&self, class_name: &str, value: &Value) -> DbResult<InsertValues> {
        let object = value
            .as_object()
            .ok_or_else(|| DbError::InvalidValue("object values must be objects".to_string()))?;
        object
            .iter()
            .map(|(key, value)| {
                self.validate_key(class_name, key, FieldAction::Create)?;
                Ok((key.clone(), TValue::from_json(value)?))
            })
            .collect()
    }

    fn decode_update(&self, class_name: &str, update: &Value, actions: &[FieldAction]) -> DbResult<UpdateSpec> {
        let update = UpdateOp::decode_map(update)?;
        for (key, _) in &update {
            for action in actions {
                self.validate_key(class_name, key, *action)?;
            }
        }
        Ok(update)
    }

    fn decode_query(&self, raw: RawQuery, column: PermissionColumn) -> DbResult<Decoded> {
        let class_name = raw.class_name;
        self.schema.get(&class_name)?;

        let caller_filter = QuerySelector::decode(&raw.filter, false)?.simplify();
        let sort = SortOption::decode(&raw.sort)?;

        let mut key_paths = caller_filter.key_paths();
        for path in sort.key_paths() {
            push_unique(&mut key_paths, path);
        }
        let mut caller_matches = BTreeMap::new();
        self.decode_raw_matches(&class_name, "", &raw.matches, &mut caller_matches, &mut key_paths)?;

        let includes = self.decode_includes(&class_name, &raw.includes, &key_paths)?;
        let matches = self.decode_matches(&class_name, &includes, caller_matches)?;

        let query = DecodedQuery {
            filter: self.row_filter(caller_filter.clone(), column),
            sort,
            skip: raw.skip,
            limit: raw.limit,
            includes,
            matches,
            object_id_size: self.object_id_size,
            class_name,
        };
        Ok(Decoded {
            query,
            caller_filter,
        })
    }

    /// Decode caller matches keyed by full path, collecting every key path
    /// they use (prefixed by their path) for validation.
    fn decode_raw_matches(
        &self,
        class_name: &str,
        prefix: &str,
        raw: &BTreeMap<String, RawMatch>,
        decoded: &mut BTreeMap<String, DecodedBaseQuery>,
        key_paths: &mut Vec<String>,
    ) -> DbResult<()> {
        for (key, raw_match) in raw {
            let resolved = self.schema.resolve_column(class_name, key)?;
            let target = match (resolved.data_type.target(), &resolved.remaining) {
                (Some(target), None) => target,
                _ => return Err(DbError::InvalidPath(format!("{}{}", prefix, key))),
            };
            let path = format!("{}{}", prefix, resolved.column);

            let filter = QuerySelector::decode(&raw_match.filter, false)?.simplify();
            let sort = SortOption::decode(&raw_match.sort)?;
            push_unique(key_paths, path.clone());
            for key_path in filter.key_paths().into_iter().chain(sort.key_paths()) {
                push_unique(key_paths, format!("{}.{}", path, key_path));
            }
            decoded.insert(
                path.clone(),
                DecodedBaseQuery {
                    filter,
                    sort,
                    skip: raw_match.skip,
                    limit: raw_match.limit,
                },
            );
            self.decode_raw_matches(target, &format!("{}.", path), &raw_match.matches, decoded, key_paths)?;
        }
        Ok(())
    }

    /// One sub-query per populated pointer or relation: row permissions of
    /// the target, plus whatever the caller asked for.
    fn decode_matches(
        &self,
        class_name: &str,
        includes: &[String],
        mut caller_matches: BTreeMap<String, DecodedBaseQuery>,
    ) -> DbResult<BTreeMap<String, DecodedBaseQuery>> {
        let mut paths = Vec::new();
        for include in includes {
            self.reference_paths(class_name, include, "", &mut paths)?;
        }

        Ok(paths
            .into_iter()
            .map(|path| {
                let base = caller_matches.remove(&path).unwrap_or_default();
                let decoded = DecodedBaseQuery {
                    filter: self.row_filter(base.filter, PermissionColumn::Read),
                    ..base
                };
                (path, decoded)
            })
            .collect())
    }

    /// Full paths of every pointer or relation crossed by `path`
    fn reference_paths(&self, class_name: &str, path: &str, prefix: &str, out: &mut Vec<String>) -> DbResult<()> {
        let resolved = self.schema.resolve_column(class_name, path)?;
        let Some(target) = resolved.data_type.target() else {
            return Ok(());
        };
        let full = format!("{}{}", prefix, resolved.column);
        push_unique(out, full.clone());

        let rest = match (resolved.data_type, resolved.remaining.as_deref()) {
            (DataType::Relation { .. }, Some(rest)) => super::keys::skip_index(rest),
            (_, rest) => rest,
        };
        match rest {
            Some(rest) => self.reference_paths(target, rest, &format!("{}.", full), out),
            None => Ok(()),
        }
    }
}
