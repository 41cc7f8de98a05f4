//! Selector Core - storage-independent query selector parser and evaluator.
//!
//! This crate decodes the JSON selector language (`$and/$or/$nor`, field
//! operators, `$expr` expressions, sort options and update operators) into a
//! closed, typed AST, simplifies it, and evaluates it in memory. The SQL
//! compiler in the server crate mirrors these semantics.
//!
//! # Example
//!
//! ```rust
//! use selector_core::{QuerySelector, TValue};
//! use serde_json::json;
//!
//! let selector = QuerySelector::decode(&json!({"age": {"$gte": 18}}), false).unwrap();
//! let doc = TValue::from_json(&json!({"age": 30})).unwrap();
//! assert!(selector.eval(&doc));
//! ```

pub mod error;
pub mod eval;
pub mod expression;
pub mod selector;
pub mod sort;
pub mod update;
pub mod value;

// Re-export main types for convenience
pub use error::{SelectorError, SelectorResult};
pub use eval::euclidean_distance;
pub use expression::{BinaryOp, NaryOp, QueryExpression, UnaryOp, VectorOperand};
pub use selector::{
    ComparisonOp, ConditionalType, FieldExpression, MembershipOp, Pattern, QuerySelector, SetOp,
    ELEMENT_FIELD,
};
pub use sort::{ExpressionSort, SortOption, SortOrder};
pub use update::UpdateOp;
pub use value::TValue;
