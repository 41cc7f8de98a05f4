//! Query validator
//!
//! Entry point for untrusted requests. Each operation rejects cyclic or
//! overly deep input, NFD-normalizes it, decodes it against the schema with
//! the caller's permissions and only then hands the decoded query to
//! [`Storage`]. Nothing reaches storage unless the whole request passed.

pub mod decoder;
pub mod filter;
pub mod keys;
pub mod normalize;
pub mod recursive;
pub mod request;

pub use decoder::QueryDecoder;
pub use filter::{is_get_method, PermissionColumn};
pub use normalize::normalize;
pub use recursive::{recursive_check, MAX_DEPTH};
pub use request::{RawInsertOptions, RawMatch, RawQuery};

use async_stream::try_stream;
use futures::stream::{BoxStream, Stream, TryStreamExt};
use serde_json::Value;

use crate::error::{DbError, DbResult};
use crate::query::{DecodedQuery, DEFAULT_OBJECT_ID_SIZE};
use crate::schema::PUBLIC_SUBJECT;
use crate::storage::Storage;

/// Who is asking
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Role subjects (`role:<name>`) and other ACL subjects
    pub acls: Vec<String>,
    pub is_master: bool,
    /// Also exposes secure fields
    pub disable_security: bool,
    pub user_id: Option<String>,
}

impl CallerIdentity {
    pub fn new(acls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            acls: acls.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn master() -> Self {
        Self {
            is_master: true,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn disable_security(mut self) -> Self {
        self.disable_security = true;
        self
    }

    /// `*`, every ACL subject, then the user id
    pub fn acl_subjects(&self) -> Vec<String> {
        let mut subjects = vec![PUBLIC_SUBJECT.to_string()];
        for subject in self.acls.iter().chain(self.user_id.as_ref()) {
            if !subjects.contains(subject) {
                subjects.push(subject.clone());
            }
        }
        subjects
    }
}

pub struct QueryValidator<S> {
    storage: S,
    identity: CallerIdentity,
    object_id_size: usize,
}

impl<S: Storage> QueryValidator<S> {
    pub fn new(storage: S, identity: CallerIdentity) -> Self {
        Self {
            storage,
            identity,
            object_id_size: DEFAULT_OBJECT_ID_SIZE,
        }
    }

    pub fn with_object_id_size(mut self, size: usize) -> Self {
        self.object_id_size = size;
        self
    }

    pub fn identity(&self) -> &CallerIdentity {
        &self.identity
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn redact(&self, err: DbError) -> DbError {
        err.redact(self.identity.is_master)
    }

    /// Check, normalize and parse one raw input
    fn input<T: serde::de::DeserializeOwned>(value: Value) -> DbResult<T> {
        recursive_check(&value)?;
        request::parse(normalize(value)?)
    }

    fn raw(value: Value) -> DbResult<Value> {
        recursive_check(&value)?;
        normalize(value)
    }

    /// Decode against the current schema; errors are redacted for callers
    /// that are not master.
    fn decode<T>(&self, build: impl FnOnce(&QueryDecoder<'_>) -> DbResult<T>) -> DbResult<T> {
        let schema = self.storage.schema();
        let decoder = QueryDecoder::new(&schema, &self.identity).with_object_id_size(self.object_id_size);
        build(&decoder).map_err(|e| self.redact(e))
    }

    pub async fn explain(&self, query: Value) -> DbResult<Value> {
        let decoded = self.decode(|d| d.explain(Self::input(query)?))?;
        self.storage.explain(&decoded).await.map_err(|e| self.redact(e))
    }

    pub async fn count(&self, query: Value) -> DbResult<u64> {
        let decoded = self.decode(|d| d.count(Self::input(query)?))?;
        self.storage.count(&decoded).await.map_err(|e| self.redact(e))
    }

    /// Validate `query` up front, then stream matching objects lazily.
    pub fn find(&self, query: Value) -> DbResult<BoxStream<'_, DbResult<Value>>> {
        let decoded = self.decode(|d| d.find(Self::input(query)?))?;
        Ok(Box::pin(self.find_rows(decoded)))
    }

    fn find_rows(&self, decoded: DecodedQuery) -> impl Stream<Item = DbResult<Value>> + Send + '_ {
        try_stream! {
            let mut rows = self.storage.find(&decoded);
            while let Some(row) = rows.try_next().await.map_err(|e| self.redact(e))? {
                yield row;
            }
        }
    }

    /// Collect every object `find` yields
    pub async fn find_all(&self, query: Value) -> DbResult<Vec<Value>> {
        self.find(query)?.try_collect().await
    }

    pub async fn insert(&self, options: Value, values: Vec<Value>) -> DbResult<Vec<Value>> {
        let values = Self::raw(Value::Array(values))?;
        let (options, values) = self.decode(|d| {
            let items = values.as_array().map(Vec::as_slice).unwrap_or_default();
            d.insert(Self::input(options)?, items)
        })?;
        self.storage
            .insert(&options, &values)
            .await
            .map_err(|e| self.redact(e))
    }

    pub async fn update_one(&self, query: Value, update: Value) -> DbResult<Option<Value>> {
        let update = Self::raw(update)?;
        let (decoded, update) = self.decode(|d| d.update_one(Self::input(query)?, &update))?;
        self.storage
            .update_one(&decoded, &update)
            .await
            .map_err(|e| self.redact(e))
    }

    pub async fn upsert_one(&self, query: Value, update: Value, set_on_insert: Value) -> DbResult<Value> {
        let update = Self::raw(update)?;
        let set_on_insert = Self::raw(set_on_insert)?;
        let (decoded, update, set_on_insert) =
            self.decode(|d| d.upsert_one(Self::input(query)?, &update, &set_on_insert))?;
        self.storage
            .upsert_one(&decoded, &update, &set_on_insert)
            .await
            .map_err(|e| self.redact(e))
    }

    pub async fn delete_one(&self, query: Value) -> DbResult<Option<Value>> {
        let decoded = self.decode(|d| d.delete_one(Self::input(query)?))?;
        self.storage.delete_one(&decoded).await.map_err(|e| self.redact(e))
    }

    pub async fn delete_many(&self, query: Value) -> DbResult<u64> {
        let decoded = self.decode(|d| d.delete_many(Self::input(query)?))?;
        self.storage.delete_many(&decoded).await.map_err(|e| self.redact(e))
    }
}
