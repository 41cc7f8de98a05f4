use selector_core::SelectorError;
use thiserror::Error;

/// SQLSTATE codes that abort a transaction but may succeed when retried:
/// serialization_failure, deadlock_detected, lock_not_available.
pub const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01", "55P03"];

/// query_canceled, raised when `statement_timeout` expires
pub const QUERY_CANCELED_SQLSTATE: &str = "57014";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Deliberately carries no detail
    #[error("No permission")]
    NoPermission,

    #[error("Recursive structure detected")]
    RecursiveStructure,

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Serialization conflict: {0}")]
    SerializationConflict(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Database error [{code}]: {message}")]
    Database { code: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Stable, machine-checkable error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidExpression,
    InvalidPath,
    InvalidKey,
    InvalidValue,
    NoPermission,
    RecursiveStructure,
    UnsupportedOperation,
    SerializationConflict,
    ConnectionError,
    Database,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidExpression => "invalid_expression",
            ErrorKind::InvalidPath => "invalid_path",
            ErrorKind::InvalidKey => "invalid_key",
            ErrorKind::InvalidValue => "invalid_value",
            ErrorKind::NoPermission => "no_permission",
            ErrorKind::RecursiveStructure => "recursive_structure",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::SerializationConflict => "serialization_conflict",
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::Database => "database",
            ErrorKind::Internal => "internal",
        }
    }
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::InvalidExpression(_) | DbError::JsonError(_) => ErrorKind::InvalidExpression,
            DbError::InvalidPath(_) => ErrorKind::InvalidPath,
            DbError::InvalidKey(_) => ErrorKind::InvalidKey,
            DbError::InvalidValue(_) => ErrorKind::InvalidValue,
            DbError::NoPermission => ErrorKind::NoPermission,
            DbError::RecursiveStructure => ErrorKind::RecursiveStructure,
            DbError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            DbError::SerializationConflict(_) => ErrorKind::SerializationConflict,
            DbError::ConnectionError(_) => ErrorKind::ConnectionError,
            DbError::Database { .. } => ErrorKind::Database,
            DbError::IoError(_) | DbError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Build an error from a backend SQLSTATE code.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if RETRYABLE_SQLSTATES.contains(&code) {
            DbError::SerializationConflict(format!("{} ({})", message, code))
        } else if code.starts_with("08") {
            DbError::ConnectionError(message)
        } else if code == QUERY_CANCELED_SQLSTATE {
            DbError::ConnectionError(format!("query timed out: {}", message))
        } else {
            DbError::Database {
                code: code.to_string(),
                message,
            }
        }
    }

    /// True when a top-level transaction may be retried after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::SerializationConflict(_))
    }

    /// Hide schema details from callers that are not master.
    ///
    /// Unknown or disallowed paths become a bare `NoPermission` so a caller
    /// cannot discover which fields exist.
    pub fn redact(self, is_master: bool) -> Self {
        match self {
            DbError::InvalidKey(_) | DbError::InvalidPath(_) if !is_master => DbError::NoPermission,
            other => other,
        }
    }
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<SelectorError> for DbError {
    fn from(err: SelectorError) -> Self {
        match err {
            SelectorError::InvalidExpression(msg) => DbError::InvalidExpression(msg),
            SelectorError::InvalidValue(msg) => DbError::InvalidValue(msg),
        }
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db) = err.as_db_error() {
            return DbError::from_sqlstate(db.code().code(), db.message());
        }
        if let Some(code) = err.code() {
            return DbError::from_sqlstate(code.code(), err.to_string());
        }
        if err.is_closed() {
            return DbError::ConnectionError(err.to_string());
        }
        DbError::InternalError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DbError::InvalidExpression("unknown operator '$where'".to_string());
        assert_eq!(err.to_string(), "Invalid expression: unknown operator '$where'");

        let err = DbError::InvalidPath("Post.author.x".to_string());
        assert_eq!(err.to_string(), "Invalid path: Post.author.x");

        let err = DbError::NoPermission;
        assert_eq!(err.to_string(), "No permission");

        let err = DbError::UnsupportedOperation("$push on TEXT".to_string());
        assert_eq!(err.to_string(), "Unsupported operation: $push on TEXT");

        let err = DbError::Database {
            code: "23505".to_string(),
            message: "duplicate key".to_string(),
        };
        assert_eq!(err.to_string(), "Database error [23505]: duplicate key");
    }

    #[test]
    fn test_sqlstate_classification() {
        for code in ["40001", "40P01", "55P03"] {
            let err = DbError::from_sqlstate(code, "conflict");
            assert_eq!(err.kind(), ErrorKind::SerializationConflict);
            assert!(err.is_retryable());
        }

        let err = DbError::from_sqlstate("08006", "connection failure");
        assert_eq!(err.kind(), ErrorKind::ConnectionError);

        let err = DbError::from_sqlstate("57014", "canceling statement due to statement timeout");
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
        assert!(!err.is_retryable());

        let err = DbError::from_sqlstate("23505", "duplicate key");
        assert_eq!(err.kind(), ErrorKind::Database);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_redact_hides_paths_from_non_master() {
        let err = DbError::InvalidPath("secret".to_string()).redact(false);
        assert!(matches!(err, DbError::NoPermission));

        let err = DbError::InvalidKey("_id".to_string()).redact(false);
        assert!(matches!(err, DbError::NoPermission));

        let err = DbError::InvalidPath("secret".to_string()).redact(true);
        assert_eq!(err.kind(), ErrorKind::InvalidPath);

        let err = DbError::RecursiveStructure.redact(false);
        assert_eq!(err.kind(), ErrorKind::RecursiveStructure);
    }

    #[test]
    fn test_selector_error_conversion() {
        let err: DbError = SelectorError::InvalidExpression("$foo".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::InvalidExpression);
        assert_eq!(err.kind().as_str(), "invalid_expression");
    }

    #[test]
    fn test_error_serializes_as_message() {
        let json = serde_json::to_value(DbError::NoPermission).unwrap();
        assert_eq!(json, serde_json::json!("No permission"));
    }

    #[test]
    fn test_db_result_type() {
        let ok_result: DbResult<i32> = Ok(42);
        assert_eq!(ok_result.unwrap(), 42);

        let err_result: DbResult<i32> = Err(DbError::NoPermission);
        assert!(err_result.is_err());
    }
}
