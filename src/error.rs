//! Error types for tablesync.
//!
//! Errors are scoped: most variants name the table they belong to so the
//! orchestrator can isolate a failure to one table, record it to the ledger,
//! and move on. Only connection-level failures abort a whole run.

use thiserror::Error;

/// Result type for tablesync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification, used for event payloads and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    /// Could not open or keep a connection (retriable, aborts the run)
    Connection,
    /// System catalog query failed
    CatalogQuery,
    /// Source table does not exist
    TableNotFound,
    /// Table has no primary key and no override was supplied
    NoPrimaryKey,
    /// Primary-key override names a column absent from the source table
    InvalidPkOverride,
    /// DDL execution on the destination failed
    DdlExecution,
    /// Delta scan or merge failed
    DeltaComputation,
    /// Applying a write batch failed (transaction rolled back)
    BatchApply,
    /// Ledger read/write failed
    LedgerUpdate,
    /// Cooperative cancellation was observed
    Canceled,
    /// A command exceeded its timeout
    Timeout,
    /// A statement failed without a narrower classification
    Query,
    /// Invalid configuration
    Configuration,
}

impl ErrorKind {
    /// Whether errors of this kind are generally worth retrying.
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }

    /// Stable lowercase label for logs and event payloads.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::CatalogQuery => "catalog_query",
            Self::TableNotFound => "table_not_found",
            Self::NoPrimaryKey => "no_primary_key",
            Self::InvalidPkOverride => "invalid_pk_override",
            Self::DdlExecution => "ddl_execution",
            Self::DeltaComputation => "delta_computation",
            Self::BatchApply => "batch_apply",
            Self::LedgerUpdate => "ledger_update",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
            Self::Query => "query",
            Self::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for tablesync.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection to source or destination failed.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        /// What went wrong
        message: String,
    },

    /// A system catalog query failed.
    #[error("catalog query failed for {table}: {message}")]
    CatalogQueryFailed {
        /// Qualified table name
        table: String,
        /// Underlying failure
        message: String,
    },

    /// The source table does not exist.
    #[error("table not found: {table}")]
    TableNotFound {
        /// Qualified table name
        table: String,
    },

    /// No primary key could be resolved for the table.
    #[error("no primary key for {table}; configure primary-key columns explicitly")]
    NoPrimaryKey {
        /// Qualified table name
        table: String,
    },

    /// A configured primary-key override column does not exist at the source.
    #[error("invalid primary-key override for {table}: column '{column}' not found")]
    InvalidPkOverride {
        /// Qualified table name
        table: String,
        /// The missing column
        column: String,
    },

    /// DDL execution on the destination failed.
    #[error("DDL execution failed for {table}: {message}")]
    DdlExecutionFailed {
        /// Qualified table name
        table: String,
        /// Underlying failure
        message: String,
    },

    /// Delta scan or merge failed.
    #[error("delta computation failed for {table}: {message}")]
    DeltaComputationFailed {
        /// Qualified table name
        table: String,
        /// Underlying failure
        message: String,
    },

    /// A write batch failed; the table's transaction was rolled back.
    #[error("batch apply failed for {table}: {message}")]
    BatchApplyFailed {
        /// Qualified table name
        table: String,
        /// Underlying failure
        message: String,
    },

    /// A ledger read or write failed.
    #[error("ledger update failed: {message}")]
    LedgerUpdateFailed {
        /// Underlying failure
        message: String,
    },

    /// The cancellation signal was observed.
    #[error("operation canceled")]
    Canceled,

    /// A command exceeded the configured timeout.
    #[error("command timed out after {seconds}s")]
    Timeout {
        /// Configured timeout that elapsed
        seconds: u64,
    },

    /// A query or statement failed below any table-scoped context.
    ///
    /// Components wrap this into the scoped variant for the operation they
    /// were performing ([`Error::catalog`], [`Error::delta`], ...).
    #[error("query failed: {message}")]
    Query {
        /// Underlying failure
        message: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is invalid
        message: String,
    },
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionFailed { .. } => ErrorKind::Connection,
            Self::CatalogQueryFailed { .. } => ErrorKind::CatalogQuery,
            Self::TableNotFound { .. } => ErrorKind::TableNotFound,
            Self::NoPrimaryKey { .. } => ErrorKind::NoPrimaryKey,
            Self::InvalidPkOverride { .. } => ErrorKind::InvalidPkOverride,
            Self::DdlExecutionFailed { .. } => ErrorKind::DdlExecution,
            Self::DeltaComputationFailed { .. } => ErrorKind::DeltaComputation,
            Self::BatchApplyFailed { .. } => ErrorKind::BatchApply,
            Self::LedgerUpdateFailed { .. } => ErrorKind::LedgerUpdate,
            Self::Canceled => ErrorKind::Canceled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Query { .. } => ErrorKind::Query,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Whether this error is worth retrying.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Whether this error is scoped to a single table (the run continues).
    pub fn is_table_scoped(&self) -> bool {
        !matches!(self, Self::ConnectionFailed { .. } | Self::Canceled)
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Create a catalog query error for a table.
    pub fn catalog(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CatalogQueryFailed {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a DDL execution error for a table.
    pub fn ddl(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DdlExecutionFailed {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a delta computation error for a table.
    pub fn delta(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeltaComputationFailed {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a batch apply error for a table.
    pub fn apply(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BatchApplyFailed {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a ledger error.
    pub fn ledger(message: impl Into<String>) -> Self {
        Self::LedgerUpdateFailed {
            message: message.into(),
        }
    }

    /// Create a low-level query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::connection("x").kind(), ErrorKind::Connection);
        assert_eq!(
            Error::catalog("dbo.t", "boom").kind(),
            ErrorKind::CatalogQuery
        );
        assert_eq!(Error::Canceled.kind(), ErrorKind::Canceled);
        assert_eq!(Error::Timeout { seconds: 300 }.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_retriability() {
        assert!(Error::connection("refused").is_retriable());
        assert!(Error::Timeout { seconds: 30 }.is_retriable());
        assert!(!Error::NoPrimaryKey {
            table: "dbo.t".into()
        }
        .is_retriable());
        assert!(!Error::Canceled.is_retriable());
    }

    #[test]
    fn test_table_scoping() {
        assert!(Error::ddl("dbo.t", "boom").is_table_scoped());
        assert!(Error::NoPrimaryKey {
            table: "dbo.t".into()
        }
        .is_table_scoped());
        assert!(!Error::connection("refused").is_table_scoped());
        assert!(!Error::Canceled.is_table_scoped());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::NoPrimaryKey {
            table: "[dbo].[Orphan]".into(),
        };
        assert!(err.to_string().contains("primary-key columns explicitly"));

        let err = Error::InvalidPkOverride {
            table: "[dbo].[Customer]".into(),
            column: "Missing".into(),
        };
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ErrorKind::BatchApply.as_str(), "batch_apply");
        assert_eq!(ErrorKind::Canceled.to_string(), "canceled");
    }
}
