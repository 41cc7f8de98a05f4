//! Transaction options and the per-transaction handle.

pub mod handle;

pub use handle::{Session, TransactionState};

use serde::{Deserialize, Serialize};

/// Isolation level for transactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    /// Whatever the server is configured with
    #[default]
    Default,
    /// Read only committed data
    ReadCommitted,
    /// Repeatable reads within transaction
    RepeatableRead,
    /// Fully serializable execution
    Serializable,
}

impl IsolationLevel {
    /// Statement that opens a top-level transaction at this level
    pub fn begin_statement(&self) -> &'static str {
        match self {
            IsolationLevel::Default => "BEGIN",
            IsolationLevel::ReadCommitted => "BEGIN ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "BEGIN ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "BEGIN ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// Options for `with_transaction`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TransactionOptions {
    /// Isolation mode; ignored for nested transactions
    #[serde(default)]
    pub mode: Option<IsolationLevel>,
    /// Extra attempts after a serialization conflict; ignored when nested
    #[serde(default)]
    pub retry: Option<u32>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: IsolationLevel) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_statements() {
        assert_eq!(IsolationLevel::Default.begin_statement(), "BEGIN");
        assert_eq!(
            IsolationLevel::RepeatableRead.begin_statement(),
            "BEGIN ISOLATION LEVEL REPEATABLE READ"
        );
    }

    #[test]
    fn test_isolation_from_config_string() {
        let level: IsolationLevel = serde_json::from_str("\"repeatable-read\"").unwrap();
        assert_eq!(level, IsolationLevel::RepeatableRead);
        let level: IsolationLevel = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(level, IsolationLevel::Default);
    }

    #[test]
    fn test_options_builder() {
        let options = TransactionOptions::new()
            .mode(IsolationLevel::Serializable)
            .retry(3);
        assert_eq!(options.mode, Some(IsolationLevel::Serializable));
        assert_eq!(options.retry, Some(3));
    }
}
