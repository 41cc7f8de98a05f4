//! Schema model
//!
//! A [`SchemaMap`] maps class names to their [`Schema`]: typed fields,
//! class-level and field-level permissions, secure fields and indexes.
//! Schemas are immutable once prepared; everything here is lookup.

pub mod permission;
pub mod types;

pub use permission::{is_permitted, ClassAction, FieldAction, PUBLIC_SUBJECT};
pub use types::DataType;

use once_cell::sync::Lazy;
use regex::Regex;
use selector_core::SortOrder;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::{DbError, DbResult};

/// Keys every class carries, in projection order
pub const DEFAULT_KEYS: &[&str] = &[
    "_id",
    "__v",
    "_created_at",
    "_updated_at",
    "_expired_at",
    "_rperm",
    "_wperm",
];

/// Default keys that callers can never write
pub const READ_ONLY_KEYS: &[&str] = &["_id", "__v", "_created_at", "_updated_at"];

static DEFAULT_FIELDS: Lazy<BTreeMap<&'static str, DataType>> = Lazy::new(|| {
    BTreeMap::from([
        ("_id", DataType::String),
        ("__v", DataType::Number),
        ("_created_at", DataType::Date),
        ("_updated_at", DataType::Date),
        ("_expired_at", DataType::Date),
        ("_rperm", DataType::StringArray),
        ("_wperm", DataType::StringArray),
    ])
});

static CLASS_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid class name regex"));

pub fn is_default_key(name: &str) -> bool {
    DEFAULT_KEYS.contains(&name)
}

/// Index declaration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexSpec {
    #[serde(rename = "type", default)]
    pub kind: IndexKind,
    pub keys: IndexKeys,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub method: VectorMethod,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    #[default]
    Basic,
    Vector,
}

/// Approximate nearest neighbour index method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorMethod {
    #[default]
    Hnsw,
    Ivfflat,
}

impl VectorMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorMethod::Hnsw => "hnsw",
            VectorMethod::Ivfflat => "ivfflat",
        }
    }
}

/// `{"a": 1, "b": -1}` or `["x", "y"]`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IndexKeys {
    Ordered(serde_json::Map<String, Value>),
    List(Vec<String>),
}

impl IndexSpec {
    /// Keys with their sort direction; lists are ascending.
    pub fn key_orders(&self) -> DbResult<Vec<(String, SortOrder)>> {
        match &self.keys {
            IndexKeys::List(keys) => Ok(keys
                .iter()
                .map(|k| (k.clone(), SortOrder::Ascending))
                .collect()),
            IndexKeys::Ordered(map) => map
                .iter()
                .map(|(key, order)| match order.as_i64() {
                    Some(1) => Ok((key.clone(), SortOrder::Ascending)),
                    Some(-1) => Ok((key.clone(), SortOrder::Descending)),
                    _ => Err(DbError::InvalidValue(format!(
                        "index order for '{}' must be 1 or -1",
                        key
                    ))),
                })
                .collect(),
        }
    }
}

/// Schema of one class
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Schema {
    #[serde(default)]
    pub fields: BTreeMap<String, DataType>,
    #[serde(default)]
    pub class_level_permissions: HashMap<ClassAction, Vec<String>>,
    #[serde(default)]
    pub field_level_permissions: HashMap<String, HashMap<FieldAction, Vec<String>>>,
    #[serde(default)]
    pub secure_fields: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl Schema {
    /// Look up a top-level field, including default keys
    pub fn field(&self, name: &str) -> Option<&DataType> {
        DEFAULT_FIELDS.get(name).or_else(|| self.fields.get(name))
    }

    pub fn allows_class(&self, action: ClassAction, acls: &[String]) -> bool {
        is_permitted(self.class_level_permissions.get(&action), acls)
    }

    pub fn allows_field(&self, field: &str, action: FieldAction, acls: &[String]) -> bool {
        is_permitted(
            self.field_level_permissions
                .get(field)
                .and_then(|rules| rules.get(&action)),
            acls,
        )
    }

    pub fn is_secure(&self, field: &str) -> bool {
        self.secure_fields.iter().any(|f| f == field)
    }

    /// Every stored or virtual column: default keys first, then fields with
    /// shapes flattened to `a.b` names.
    pub fn columns(&self) -> Vec<(String, &DataType)> {
        let mut columns: Vec<(String, &DataType)> = DEFAULT_KEYS
            .iter()
            .filter_map(|key| DEFAULT_FIELDS.get(key).map(|ty| (key.to_string(), ty)))
            .collect();
        for (name, ty) in &self.fields {
            flatten_into(name.clone(), ty, &mut columns);
        }
        columns
    }
}

fn flatten_into<'a>(name: String, ty: &'a DataType, out: &mut Vec<(String, &'a DataType)>) {
    match ty {
        DataType::Shape(fields) => {
            for (sub, sub_ty) in fields {
                flatten_into(format!("{}.{}", name, sub), sub_ty, out);
            }
        }
        _ => out.push((name, ty)),
    }
}

/// Column a dotted path lands on
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedColumn<'a> {
    /// Flattened column name, e.g. `address.zip`
    pub column: String,
    /// Top-level field the column belongs to
    pub field: String,
    pub data_type: &'a DataType,
    /// Path left after the column, e.g. `name` in `author.name`
    pub remaining: Option<String>,
}

/// All class schemas
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct SchemaMap {
    classes: BTreeMap<String, Schema>,
}

impl SchemaMap {
    pub fn new(classes: BTreeMap<String, Schema>) -> Self {
        Self { classes }
    }

    pub fn from_json(value: &Value) -> DbResult<Self> {
        serde_json::from_value(value.clone()).map_err(|e| DbError::InvalidValue(e.to_string()))
    }

    /// Add built-in classes and check every schema for consistency.
    pub fn prepare(mut self) -> DbResult<Self> {
        for (name, schema) in builtin_classes() {
            self.classes.entry(name).or_insert(schema);
        }
        for name in self.classes.keys() {
            if !CLASS_NAME.is_match(name) {
                return Err(DbError::InvalidValue(format!("invalid class name '{}'", name)));
            }
        }
        for name in self.classes.keys() {
            self.validate_shape(name)?;
        }
        Ok(self)
    }

    pub fn classes(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Schema)> {
        self.classes.iter()
    }

    pub fn get(&self, class_name: &str) -> DbResult<&Schema> {
        self.classes
            .get(class_name)
            .ok_or_else(|| DbError::InvalidPath(format!("unknown class '{}'", class_name)))
    }

    /// Walk shape fields greedily until a primitive, pointer, relation or an
    /// exhausted shape is reached.
    pub fn resolve_column(&self, class_name: &str, path: &str) -> DbResult<ResolvedColumn<'_>> {
        let schema = self.get(class_name)?;
        let invalid = || DbError::InvalidPath(format!("{}.{}", class_name, path));

        let mut segments = path.split('.');
        let field = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let mut data_type = schema.field(field).ok_or_else(invalid)?;
        let mut column = field.to_string();

        while let DataType::Shape(fields) = data_type {
            let Some(segment) = segments.next() else {
                break;
            };
            data_type = fields.get(segment).ok_or_else(invalid)?;
            column.push('.');
            column.push_str(segment);
        }

        let rest: Vec<&str> = segments.collect();
        if rest.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }
        Ok(ResolvedColumn {
            column,
            field: field.to_string(),
            data_type,
            remaining: (!rest.is_empty()).then(|| rest.join(".")),
        })
    }

    fn validate_shape(&self, class_name: &str) -> DbResult<()> {
        let schema = self.get(class_name)?;
        let invalid = |msg: String| DbError::InvalidValue(format!("{}: {}", class_name, msg));

        for (name, ty) in &schema.fields {
            self.validate_field(class_name, name, ty)?;
        }
        for field in &schema.secure_fields {
            if !schema.fields.contains_key(field) {
                return Err(invalid(format!("unknown secure field '{}'", field)));
            }
        }
        for field in schema.field_level_permissions.keys() {
            if schema.field(field).is_none() {
                return Err(invalid(format!("permission on unknown field '{}'", field)));
            }
        }
        for index in &schema.indexes {
            let keys = index.key_orders()?;
            if keys.is_empty() {
                return Err(invalid("index without keys".to_string()));
            }
            for (key, _) in &keys {
                let resolved = self.resolve_column(class_name, key)?;
                let usable = match index.kind {
                    IndexKind::Basic => !resolved.data_type.is_virtual() && resolved.remaining.is_none(),
                    IndexKind::Vector => match resolved.data_type {
                        DataType::Vector { .. } => keys.len() == 1,
                        DataType::Number => true,
                        _ => false,
                    },
                };
                if !usable || resolved.data_type.is_shape() {
                    return Err(invalid(format!("cannot index '{}'", key)));
                }
            }
        }
        Ok(())
    }

    fn validate_field(&self, class_name: &str, name: &str, ty: &DataType) -> DbResult<()> {
        let invalid = |msg: String| DbError::InvalidValue(format!("{}.{}: {}", class_name, name, msg));

        let last = name.rsplit('.').next().unwrap_or(name);
        if last.is_empty() || last.starts_with('_') || last.starts_with('$') || last.contains('.') {
            return Err(invalid("invalid field name".to_string()));
        }

        match ty {
            DataType::Vector { dimension } if *dimension == 0 => {
                Err(invalid("vector dimension must be positive".to_string()))
            }
            DataType::Pointer { target } => self.get(target).map(|_| ()),
            DataType::Relation {
                target,
                foreign_field,
            } => {
                let target_schema = self.get(target)?;
                if let Some(foreign) = foreign_field {
                    match target_schema.fields.get(foreign) {
                        Some(DataType::Pointer { .. })
                        | Some(DataType::Relation {
                            foreign_field: None,
                            ..
                        }) => Ok(()),
                        _ => Err(invalid(format!(
                            "foreign field '{}.{}' must be a plain pointer or relation",
                            target, foreign
                        ))),
                    }
                } else {
                    Ok(())
                }
            }
            DataType::Shape(fields) => {
                if fields.is_empty() {
                    return Err(invalid("empty shape".to_string()));
                }
                for (sub, sub_ty) in fields {
                    if sub.contains('.') {
                        return Err(invalid(format!("invalid shape key '{}'", sub)));
                    }
                    self.validate_field(class_name, &format!("{}.{}", name, sub), sub_ty)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Classes every deployment has, unless the caller defines them
fn builtin_classes() -> Vec<(String, Schema)> {
    let user = Schema {
        fields: BTreeMap::from([
            ("name".to_string(), DataType::String),
            ("username".to_string(), DataType::String),
            ("email".to_string(), DataType::String),
            ("password".to_string(), DataType::Object),
        ]),
        secure_fields: vec!["password".to_string()],
        ..Default::default()
    };
    let role = Schema {
        fields: BTreeMap::from([
            ("name".to_string(), DataType::String),
            (
                "users".to_string(),
                DataType::Relation {
                    target: "User".to_string(),
                    foreign_field: None,
                },
            ),
            (
                "roles".to_string(),
                DataType::Relation {
                    target: "Role".to_string(),
                    foreign_field: None,
                },
            ),
        ]),
        ..Default::default()
    };
    vec![("User".to_string(), user), ("Role".to_string(), role)]
}
