//! Field data types
//!
//! A field is declared either in shorthand (`"string"`, `"date"`, ...) or in
//! object form:
//!
//! ```json
//! {"type": "pointer", "target": "User"}
//! {"type": "relation", "target": "Comment", "foreignField": "post"}
//! {"type": "vector", "dimension": 3}
//! {"type": "shape", "shape": {"street": "string", "zip": "number"}}
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// Declared type of a field
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawDataType")]
pub enum DataType {
    Boolean,
    Number,
    Decimal,
    String,
    StringArray,
    Date,
    Object,
    Array,
    Vector { dimension: usize },
    Pointer { target: String },
    Relation {
        target: String,
        foreign_field: Option<String>,
    },
    Shape(BTreeMap<String, DataType>),
}

impl DataType {
    /// Primitive types map to exactly one column
    pub fn is_primitive(&self) -> bool {
        !matches!(
            self,
            DataType::Pointer { .. } | DataType::Relation { .. } | DataType::Shape(_)
        )
    }

    pub fn is_shape(&self) -> bool {
        matches!(self, DataType::Shape(_))
    }

    /// Pointer and relation fields join another class
    pub fn is_reference(&self) -> bool {
        matches!(self, DataType::Pointer { .. } | DataType::Relation { .. })
    }

    /// Target class of a pointer or relation
    pub fn target(&self) -> Option<&str> {
        match self {
            DataType::Pointer { target } | DataType::Relation { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Relations resolved through a field on the target have no column
    pub fn is_virtual(&self) -> bool {
        matches!(
            self,
            DataType::Relation {
                foreign_field: Some(_),
                ..
            }
        )
    }

    /// Name reported by `$type` for values of this column
    pub fn value_type_name(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Number => "number",
            DataType::Decimal => "decimal",
            DataType::String | DataType::Pointer { .. } => "string",
            DataType::Date => "date",
            DataType::Object | DataType::Shape(_) => "object",
            DataType::StringArray
            | DataType::Array
            | DataType::Vector { .. }
            | DataType::Relation { .. } => "array",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "boolean"),
            DataType::Number => write!(f, "number"),
            DataType::Decimal => write!(f, "decimal"),
            DataType::String => write!(f, "string"),
            DataType::StringArray => write!(f, "string[]"),
            DataType::Date => write!(f, "date"),
            DataType::Object => write!(f, "object"),
            DataType::Array => write!(f, "array"),
            DataType::Vector { dimension } => write!(f, "vector({})", dimension),
            DataType::Pointer { target } => write!(f, "pointer<{}>", target),
            DataType::Relation { target, .. } => write!(f, "relation<{}>", target),
            DataType::Shape(_) => write!(f, "shape"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDataType {
    Short(String),
    Full(RawTypeObject),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTypeObject {
    #[serde(rename = "type")]
    kind: String,
    target: Option<String>,
    #[serde(rename = "foreignField")]
    foreign_field: Option<String>,
    dimension: Option<usize>,
    shape: Option<BTreeMap<String, DataType>>,
}

fn primitive(name: &str) -> Option<DataType> {
    match name {
        "boolean" => Some(DataType::Boolean),
        "number" => Some(DataType::Number),
        "decimal" => Some(DataType::Decimal),
        "string" => Some(DataType::String),
        "string[]" => Some(DataType::StringArray),
        "date" => Some(DataType::Date),
        "object" => Some(DataType::Object),
        "array" => Some(DataType::Array),
        _ => None,
    }
}

impl TryFrom<RawDataType> for DataType {
    type Error = String;

    fn try_from(raw: RawDataType) -> Result<Self, Self::Error> {
        let raw = match raw {
            RawDataType::Short(name) => {
                return primitive(&name).ok_or_else(|| format!("unknown data type '{}'", name))
            }
            RawDataType::Full(raw) => raw,
        };

        match raw.kind.as_str() {
            "pointer" => raw
                .target
                .map(|target| DataType::Pointer { target })
                .ok_or_else(|| "pointer requires a target".to_string()),
            "relation" => raw
                .target
                .map(|target| DataType::Relation {
                    target,
                    foreign_field: raw.foreign_field,
                })
                .ok_or_else(|| "relation requires a target".to_string()),
            "vector" => raw
                .dimension
                .map(|dimension| DataType::Vector { dimension })
                .ok_or_else(|| "vector requires a dimension".to_string()),
            "shape" => raw
                .shape
                .map(DataType::Shape)
                .ok_or_else(|| "shape requires fields".to_string()),
            other => primitive(other).ok_or_else(|| format!("unknown data type '{}'", other)),
        }
    }
}
