//! Transaction lifecycle states.

use serde::Serialize;

/// Lifecycle state of a [`Transaction`](crate::db::Transaction).
///
/// `Started` is the only state in which queries are accepted.
/// `MarkedForRollback` is reachable only from `Started` and leads only to
/// `RolledBack`; `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Started,
    Committed,
    MarkedForRollback,
    RolledBack,
}

impl TransactionStatus {
    /// Check if the transaction still accepts queries.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// Check if the transaction has ended (committed or rolled back).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Committed => "committed",
            Self::MarkedForRollback => "marked_for_rollback",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
