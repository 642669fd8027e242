//! Progress events and control signals.
//!
//! Events flow through a bounded channel the host process drains; the core
//! never calls back into the host synchronously. Cancellation travels the
//! other way as a shared flag checked between tables and between batches.

use crate::error::ErrorKind;
use crate::strategy::StrategyKind;
use crate::types::TableRef;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which delta set a batch belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchKind {
    /// Rows removed from the destination
    Delete,
    /// Rows rewritten in place
    Update,
    /// Rows added to the destination
    Insert,
}

impl BatchKind {
    /// Stable lowercase label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Update => "update",
            Self::Insert => "insert",
        }
    }
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A progress event for one table synchronization run.
#[derive(Debug, Clone, Serialize)]
pub enum SyncEvent {
    /// Processing of a table began.
    TableStarted {
        /// The table
        table: TableRef,
    },
    /// The destination table was missing and has been created as a mirror.
    TableSchemaCreated {
        /// The table
        table: TableRef,
    },
    /// A change-detection strategy was selected for the table.
    TableStrategySelected {
        /// The table
        table: TableRef,
        /// The chosen strategy
        strategy: StrategyKind,
    },
    /// One write batch was applied inside the table's transaction.
    BatchApplied {
        /// The table
        table: TableRef,
        /// Delta set the batch belonged to
        kind: BatchKind,
        /// Rows in the batch
        rows: u64,
    },
    /// The table converged and its transaction committed.
    TableCompleted {
        /// The table
        table: TableRef,
        /// Rows inserted
        inserted: u64,
        /// Rows updated
        updated: u64,
        /// Rows deleted
        deleted: u64,
    },
    /// The table failed; its transaction (if any) was rolled back.
    TableFailed {
        /// The table
        table: TableRef,
        /// Error classification
        kind: ErrorKind,
        /// Human-readable message
        error: String,
    },
}

impl SyncEvent {
    /// The table this event concerns.
    pub fn table(&self) -> &TableRef {
        match self {
            Self::TableStarted { table }
            | Self::TableSchemaCreated { table }
            | Self::TableStrategySelected { table, .. }
            | Self::BatchApplied { table, .. }
            | Self::TableCompleted { table, .. }
            | Self::TableFailed { table, .. } => table,
        }
    }
}

/// Aggregate result of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Tables the run attempted (selected tables)
    pub tables_total: usize,
    /// Tables that converged and committed
    pub tables_ok: usize,
    /// Tables that failed (or were rolled back by cancellation)
    pub tables_failed: usize,
}

impl RunSummary {
    /// Whether every attempted table succeeded.
    pub fn is_complete(&self) -> bool {
        self.tables_failed == 0 && self.tables_ok == self.tables_total
    }
}

/// Sending half of the progress channel.
///
/// A dropped receiver turns emission into a no-op; progress reporting never
/// stalls or fails the pipeline.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SyncEvent>,
}

impl EventSender {
    /// Create a bounded event channel.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Emit one event.
    pub async fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("event receiver dropped; progress events discarded");
        }
    }
}

/// Cooperative cancellation flag.
///
/// Checked between tables and between batches; the batch in flight always
/// completes or rolls back as a unit.
#[derive(Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Create a fresh, uncanceled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_canceled() {
            Err(crate::error::Error::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_kind_labels() {
        assert_eq!(BatchKind::Delete.as_str(), "delete");
        assert_eq!(BatchKind::Insert.to_string(), "insert");
    }

    #[test]
    fn test_event_table_accessor() {
        let t = TableRef::new("dbo", "Customer");
        let ev = SyncEvent::BatchApplied {
            table: t.clone(),
            kind: BatchKind::Insert,
            rows: 1000,
        };
        assert_eq!(ev.table(), &t);

        let ev = SyncEvent::TableFailed {
            table: t.clone(),
            kind: ErrorKind::BatchApply,
            error: "deadlock".into(),
        };
        assert_eq!(ev.table(), &t);
    }

    #[test]
    fn test_run_summary_completion() {
        let summary = RunSummary {
            tables_total: 3,
            tables_ok: 3,
            tables_failed: 0,
        };
        assert!(summary.is_complete());

        let summary = RunSummary {
            tables_total: 3,
            tables_ok: 2,
            tables_failed: 1,
        };
        assert!(!summary.is_complete());
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_canceled());
        assert!(flag.check().is_ok());

        let observer = flag.clone();
        flag.cancel();
        assert!(observer.is_canceled());
        assert!(matches!(
            observer.check(),
            Err(crate::error::Error::Canceled)
        ));
    }

    #[tokio::test]
    async fn test_event_sender_survives_dropped_receiver() {
        let (sender, rx) = EventSender::channel(4);
        drop(rx);
        // Must not hang or panic
        sender
            .emit(SyncEvent::TableStarted {
                table: TableRef::new("dbo", "Customer"),
            })
            .await;
    }

    #[tokio::test]
    async fn test_event_sender_delivers() {
        let (sender, mut rx) = EventSender::channel(4);
        sender
            .emit(SyncEvent::TableStarted {
                table: TableRef::new("dbo", "Customer"),
            })
            .await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.table(), &TableRef::new("dbo", "Customer"));
    }

    #[test]
    fn test_event_serializes() {
        let ev = SyncEvent::TableCompleted {
            table: TableRef::new("dbo", "Customer"),
            inserted: 3,
            updated: 0,
            deleted: 0,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("TableCompleted"));
        assert!(json.contains("Customer"));
    }
}
