//! # tablesync
//!
//! Incremental, structure-preserving table replication between two SQL
//! Server databases.
//!
//! tablesync materializes destination tables as perfect structural mirrors
//! of their sources (exact types, identity/rowversion/computed semantics,
//! collations, keys, indexes, foreign keys, constraints, triggers) and
//! converges the destination's rows to the source's with the minimum
//! necessary writes, per-table row filters, and per-table primary-key
//! overrides.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        SyncRunner (orchestrator)                 │
//! │                                                                  │
//! │  source ──▶ CatalogReader ──▶ TableSchema ──▶ ddl ──▶ dest DDL   │
//! │                                   │                              │
//! │                  Ledger ◀── strategy::select                     │
//! │                    │              │                              │
//! │                    ▼              ▼                              │
//! │              DeltaComputer ──▶ TableDelta ──▶ BatchApplier       │
//! │                                                  │               │
//! │          events ◀── EventSender ◀────────────────┘               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! | module | responsibility |
//! |--------|----------------|
//! | [`catalog`] | read one table's full structural description from `sys.*` |
//! | [`ddl`] | render ordered CREATE/ALTER statements, dependency ordering |
//! | [`ledger`] | durable per-table sync state in the destination |
//! | [`strategy`] | pick rowversion vs. hash change detection per table |
//! | [`delta`] | compute the INSERT/UPDATE/DELETE candidate sets |
//! | [`apply`] | apply deltas in transactional batches |
//! | [`orchestrator`] | drive tables in dependency order, emit events |
//!
//! ## Change detection
//!
//! Tables with a rowversion column sync incrementally from the ledger's
//! high-water mark; a first run scans from the zero stamp. Tables without
//! one fall back to a full paired scan comparing server-computed SHA2-256
//! row hashes. Either way, detection only moves primary keys and
//! fixed-size stamps across the wire.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tablesync::prelude::*;
//! use std::sync::Arc;
//!
//! let source = ClientConfig::builder()
//!     .host("src.example.com")
//!     .database("Sales")
//!     .username("reader")
//!     .password("...")
//!     .build()?;
//! let dest = ClientConfig::builder()
//!     .host("replica.example.com")
//!     .database("SalesMirror")
//!     .username("writer")
//!     .password("...")
//!     .build()?;
//!
//! let provider = Arc::new(TdsClientProvider::new(source, dest));
//! let mut runner = SyncRunner::new(SyncOptions::default(), provider)?;
//!
//! let mut events = runner.take_event_receiver().unwrap();
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! let tables = vec![
//!     TableSyncConfig::new("dbo", "Customer"),
//!     TableSyncConfig::new("dbo", "Order").with_row_filter("Sucursal = 1"),
//! ];
//! let summary = runner.run(&tables).await?;
//! println!("{}/{} tables ok", summary.tables_ok, summary.tables_total);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod apply;
pub mod catalog;
pub mod client;
pub mod config;
pub mod ddl;
pub mod delta;
pub mod error;
pub mod event;
pub mod ledger;
pub mod orchestrator;
pub mod security;
pub mod strategy;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::Value;

/// Convenient imports for embedding the engine.
pub mod prelude {
    pub use crate::catalog::{CatalogReader, ColumnDesc, ColumnKind, TableSchema};
    pub use crate::client::{
        ClientConfig, ClientProvider, SqlServerClient, TdsClientProvider,
    };
    pub use crate::config::{SyncOptions, TableSyncConfig};
    pub use crate::delta::{DeltaComputer, TableDelta};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::event::{BatchKind, CancelFlag, EventSender, RunSummary, SyncEvent};
    pub use crate::ledger::{Ledger, LedgerEntry, LedgerStrategy, SyncCounters, SyncStatus};
    pub use crate::orchestrator::{SyncRunner, TableState};
    pub use crate::strategy::{ChangeStrategy, StrategyKind};
    pub use crate::types::{Key, Row, RowVersion, TableRef, Value};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _options = SyncOptions::default();
        let _config = TableSyncConfig::new("dbo", "Customer");
        let _value = Value::Int32(42);
        let _rv = RowVersion::ZERO;
        let _flag = CancelFlag::new();
    }

    #[test]
    fn test_error_reexports() {
        let err = Error::connection("refused");
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_retriable());
    }
}
