//! Change-detection strategy selection.
//!
//! Per table: rowversion delta when the source has a rowversion column,
//! paired row-hash comparison otherwise. A rowversion table with no stored
//! high-water mark runs the same mechanism from the zero stamp, which
//! processes every row exactly like a first full sync.

use crate::catalog::TableSchema;
use crate::ledger::{LedgerEntry, LedgerStrategy};
use crate::types::RowVersion;
use serde::Serialize;

/// The selected strategy, with everything the delta computer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeStrategy {
    /// Incremental scan of rows whose rowversion exceeds the high-water mark.
    RowVersion {
        /// The source table's rowversion column
        column: String,
        /// Stamp below which rows are known synchronized
        high_water: RowVersion,
        /// True when no stored mark existed (first run; all rows processed)
        initial: bool,
    },
    /// Full paired scan comparing server-computed row hashes.
    Hash,
}

impl ChangeStrategy {
    /// Classification for events and logs.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::RowVersion { initial: false, .. } => StrategyKind::RowVersion,
            Self::RowVersion { initial: true, .. } => StrategyKind::RowVersionInitial,
            Self::Hash => StrategyKind::Hash,
        }
    }

    /// Label persisted to the ledger for this strategy.
    pub fn ledger_label(&self) -> LedgerStrategy {
        match self {
            // An initial run records INITIAL until it succeeds; success
            // flips the entry to ROWVERSION with a real high-water mark.
            Self::RowVersion { initial: true, .. } => LedgerStrategy::Initial,
            Self::RowVersion { initial: false, .. } => LedgerStrategy::RowVersion,
            Self::Hash => LedgerStrategy::Hash,
        }
    }

    /// Label recorded on success (an initial rowversion run graduates).
    pub fn success_label(&self) -> LedgerStrategy {
        match self {
            Self::RowVersion { .. } => LedgerStrategy::RowVersion,
            Self::Hash => LedgerStrategy::Hash,
        }
    }

    /// The rowversion column, when the strategy uses one.
    pub fn rowversion_column(&self) -> Option<&str> {
        match self {
            Self::RowVersion { column, .. } => Some(column),
            Self::Hash => None,
        }
    }
}

/// Strategy classification carried in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StrategyKind {
    /// Rowversion delta from a stored high-water mark
    RowVersion,
    /// Rowversion delta from the zero stamp (first run)
    RowVersionInitial,
    /// Full paired hash comparison
    Hash,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RowVersion => f.write_str("rowversion"),
            Self::RowVersionInitial => f.write_str("rowversion-initial"),
            Self::Hash => f.write_str("hash"),
        }
    }
}

/// Select the strategy for one table.
///
/// ROWVERSION needs both a rowversion column at the source and a stored
/// high-water mark recorded against the *same* column name; a renamed or
/// recreated rowversion column falls back to the initial scan.
pub fn select(schema: &TableSchema, ledger: Option<&LedgerEntry>) -> ChangeStrategy {
    let Some(rv_column) = schema.rowversion_column() else {
        return ChangeStrategy::Hash;
    };

    let stored = ledger.and_then(|entry| {
        let same_column = entry
            .rowversion_column
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case(&rv_column.name))
            .unwrap_or(false);
        if same_column {
            entry.last_rowversion_synced
        } else {
            None
        }
    });

    match stored {
        Some(high_water) => ChangeStrategy::RowVersion {
            column: rv_column.name.clone(),
            high_water,
            initial: false,
        },
        None => ChangeStrategy::RowVersion {
            column: rv_column.name.clone(),
            high_water: RowVersion::ZERO,
            initial: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDesc, ColumnKind};
    use crate::ledger::SyncStatus;
    use crate::types::TableRef;

    fn schema(with_rowversion: bool) -> TableSchema {
        let mut columns = vec![ColumnDesc {
            ordinal: 1,
            name: "Id".into(),
            type_name: "int".into(),
            max_length: 4,
            precision: 10,
            scale: 0,
            nullable: false,
            collation: None,
            is_rowguid: false,
            kind: ColumnKind::Regular,
        }];
        if with_rowversion {
            columns.push(ColumnDesc {
                ordinal: 2,
                name: "RV".into(),
                type_name: "timestamp".into(),
                max_length: 8,
                precision: 0,
                scale: 0,
                nullable: false,
                collation: None,
                is_rowguid: false,
                kind: ColumnKind::RowVersion,
            });
        }
        TableSchema {
            table: TableRef::new("dbo", "Customer"),
            columns,
            primary_key: None,
            unique_constraints: vec![],
            indexes: vec![],
            foreign_keys: vec![],
            check_constraints: vec![],
            default_constraints: vec![],
            triggers: vec![],
        }
    }

    fn entry(rv_column: Option<&str>, high_water: Option<RowVersion>) -> LedgerEntry {
        LedgerEntry {
            table: TableRef::new("dbo", "Customer"),
            primary_key_columns: vec!["Id".into()],
            pk_auto_detected: true,
            where_clause: None,
            strategy: Some(LedgerStrategy::RowVersion),
            rowversion_column: rv_column.map(str::to_owned),
            last_rowversion_synced: high_water,
            last_hash_synced: None,
            last_sync_date: None,
            last_sync_status: Some(SyncStatus::Ok),
            records_inserted: 0,
            records_updated: 0,
            records_deleted: 0,
            last_error_message: None,
            last_error_date: None,
            created_date: None,
            modified_date: None,
        }
    }

    #[test]
    fn test_hash_without_rowversion_column() {
        let strategy = select(&schema(false), None);
        assert_eq!(strategy, ChangeStrategy::Hash);
        assert_eq!(strategy.kind(), StrategyKind::Hash);
        assert_eq!(strategy.ledger_label(), LedgerStrategy::Hash);
        assert!(strategy.rowversion_column().is_none());
    }

    #[test]
    fn test_rowversion_with_stored_mark() {
        let hw = RowVersion::new([0, 0, 0, 0, 0, 0, 0, 42]);
        let entry = entry(Some("RV"), Some(hw));
        let strategy = select(&schema(true), Some(&entry));

        assert_eq!(
            strategy,
            ChangeStrategy::RowVersion {
                column: "RV".into(),
                high_water: hw,
                initial: false,
            }
        );
        assert_eq!(strategy.kind(), StrategyKind::RowVersion);
        assert_eq!(strategy.ledger_label(), LedgerStrategy::RowVersion);
    }

    #[test]
    fn test_rowversion_initial_without_ledger() {
        let strategy = select(&schema(true), None);
        assert_eq!(
            strategy,
            ChangeStrategy::RowVersion {
                column: "RV".into(),
                high_water: RowVersion::ZERO,
                initial: true,
            }
        );
        assert_eq!(strategy.kind(), StrategyKind::RowVersionInitial);
        assert_eq!(strategy.ledger_label(), LedgerStrategy::Initial);
        // Success graduates the entry
        assert_eq!(strategy.success_label(), LedgerStrategy::RowVersion);
    }

    #[test]
    fn test_rowversion_initial_when_mark_missing() {
        let entry = entry(Some("RV"), None);
        let strategy = select(&schema(true), Some(&entry));
        assert_eq!(strategy.kind(), StrategyKind::RowVersionInitial);
    }

    #[test]
    fn test_rowversion_initial_when_column_renamed() {
        // Stored mark belongs to a column that no longer exists
        let entry = entry(Some("OldRV"), Some(RowVersion::new([0; 8])));
        let strategy = select(&schema(true), Some(&entry));
        assert_eq!(strategy.kind(), StrategyKind::RowVersionInitial);
    }

    #[test]
    fn test_rowversion_column_name_case_insensitive() {
        let hw = RowVersion::new([0, 0, 0, 0, 0, 0, 1, 0]);
        let entry = entry(Some("rv"), Some(hw));
        let strategy = select(&schema(true), Some(&entry));
        assert_eq!(strategy.kind(), StrategyKind::RowVersion);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(StrategyKind::RowVersion.to_string(), "rowversion");
        assert_eq!(
            StrategyKind::RowVersionInitial.to_string(),
            "rowversion-initial"
        );
        assert_eq!(StrategyKind::Hash.to_string(), "hash");
    }
}
