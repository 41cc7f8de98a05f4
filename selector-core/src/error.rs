//! Error types for selector-core.
//!
//! Kept free of storage concerns so the parser can be embedded anywhere.

use thiserror::Error;

/// Selector decoding error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type for selector operations
pub type SelectorResult<T> = Result<T, SelectorError>;

impl SelectorError {
    pub(crate) fn expression(msg: impl Into<String>) -> Self {
        SelectorError::InvalidExpression(msg.into())
    }

    pub(crate) fn value(msg: impl Into<String>) -> Self {
        SelectorError::InvalidValue(msg.into())
    }
}

impl serde::Serialize for SelectorError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SelectorError::InvalidExpression("$foo".to_string());
        assert_eq!(err.to_string(), "Invalid expression: $foo");

        let err = SelectorError::InvalidValue("bad date".to_string());
        assert_eq!(err.to_string(), "Invalid value: bad date");
    }

    #[test]
    fn test_error_serializes_as_message() {
        let err = SelectorError::expression("unknown key");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json, serde_json::json!("Invalid expression: unknown key"));
    }
}
