//! The sync metadata ledger.
//!
//! A destination-resident control table (default `[dbo].[SyncMetadata]`),
//! one row per synchronized table. The ledger makes runs resumable (the
//! rowversion high-water mark), auditable (cumulative counters, error text),
//! and idempotent (a consistent destination yields zero writes).
//!
//! Transactional contract: [`Ledger::record_success`] is executed on the
//! destination client *while the table's data transaction is open*, so a
//! rollback discards the ledger update with the data. `record_start`,
//! `record_error`, and `record_canceled` run in their own short statements.

use crate::client::SqlServerClient;
use crate::config::SyncOptions;
use crate::error::Error;
use crate::security::{escape_string_literal, quote_identifier, validate_identifier};
use crate::types::{Row, RowVersion, TableRef, Value};
use crate::Result;
use chrono::NaiveDateTime;
use tracing::{debug, info};

/// Change-detection strategy label as persisted in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStrategy {
    /// Incremental via rowversion high-water mark
    RowVersion,
    /// Full paired scan with row hashes
    Hash,
    /// First rowversion run; no high-water mark existed yet
    Initial,
}

impl LedgerStrategy {
    /// Stable label stored in `change_detection_strategy`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RowVersion => "ROWVERSION",
            Self::Hash => "HASH",
            Self::Initial => "INITIAL",
        }
    }

    /// Parse a stored label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ROWVERSION" => Some(Self::RowVersion),
            "HASH" => Some(Self::Hash),
            "INITIAL" => Some(Self::Initial),
            _ => None,
        }
    }
}

/// Last recorded outcome of a table sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Converged and committed
    Ok,
    /// Interrupted by cancellation; committed tables stay committed
    Partial,
    /// Failed; transaction rolled back
    Error,
    /// Currently running
    Running,
}

impl SyncStatus {
    /// Stable label stored in `last_sync_status`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Partial => "PARTIAL",
            Self::Error => "ERROR",
            Self::Running => "RUNNING",
        }
    }

    /// Parse a stored label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(Self::Ok),
            "PARTIAL" => Some(Self::Partial),
            "ERROR" => Some(Self::Error),
            "RUNNING" => Some(Self::Running),
            _ => None,
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// The synchronized table
    pub table: TableRef,
    /// Effective primary-key columns
    pub primary_key_columns: Vec<String>,
    /// Whether the PK was detected from the catalog (vs overridden)
    pub pk_auto_detected: bool,
    /// Row filter predicate, if any
    pub where_clause: Option<String>,
    /// Strategy used by the last run
    pub strategy: Option<LedgerStrategy>,
    /// Rowversion column name, when the strategy uses one
    pub rowversion_column: Option<String>,
    /// High-water mark; monotonically non-decreasing
    pub last_rowversion_synced: Option<RowVersion>,
    /// Reserved; never read by this crate
    pub last_hash_synced: Option<String>,
    /// When the table last synced
    pub last_sync_date: Option<NaiveDateTime>,
    /// Outcome of the last sync
    pub last_sync_status: Option<SyncStatus>,
    /// Cumulative rows inserted across runs
    pub records_inserted: i32,
    /// Cumulative rows updated across runs
    pub records_updated: i32,
    /// Cumulative rows deleted across runs
    pub records_deleted: i32,
    /// Last error text, if any
    pub last_error_message: Option<String>,
    /// When the last error happened
    pub last_error_date: Option<NaiveDateTime>,
    /// Row creation time
    pub created_date: Option<NaiveDateTime>,
    /// Row modification time
    pub modified_date: Option<NaiveDateTime>,
}

/// Row counters for one run of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    /// Rows inserted
    pub inserted: u64,
    /// Rows updated
    pub updated: u64,
    /// Rows deleted
    pub deleted: u64,
}

impl SyncCounters {
    /// Total writes in this run.
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Accessor for the destination's sync ledger table.
#[derive(Debug, Clone)]
pub struct Ledger {
    schema: String,
    table: String,
}

const SELECT_COLUMNS: &str = "schema_name, table_name, primary_key_columns, pk_auto_detected, \
     where_clause, change_detection_strategy, rowversion_column, last_rowversion_synced, \
     last_hash_synced, last_sync_date, last_sync_status, records_inserted, records_updated, \
     records_deleted, last_error_message, last_error_date, created_date, modified_date";

impl Ledger {
    /// Create an accessor from the run options.
    pub fn new(options: &SyncOptions) -> Result<Self> {
        validate_identifier(&options.ledger_schema)?;
        validate_identifier(&options.ledger_table)?;
        Ok(Self {
            schema: options.ledger_schema.clone(),
            table: options.ledger_table.clone(),
        })
    }

    /// Bracket-quoted qualified ledger table name.
    pub fn qualified(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.table)
        )
    }

    /// Create the ledger table on the destination if it does not exist.
    pub async fn ensure(&self, dest: &mut SqlServerClient) -> Result<()> {
        let qualified = self.qualified();
        let script = format!(
            "IF NOT EXISTS ( \
                SELECT 1 FROM sys.tables t \
                INNER JOIN sys.schemas s ON t.schema_id = s.schema_id \
                WHERE s.name = '{schema}' AND t.name = '{table}' \
            ) \
            BEGIN \
                CREATE TABLE {qualified} ( \
                    id INT IDENTITY(1,1) PRIMARY KEY, \
                    schema_name NVARCHAR(128) NOT NULL, \
                    table_name NVARCHAR(128) NOT NULL, \
                    primary_key_columns NVARCHAR(MAX), \
                    pk_auto_detected BIT DEFAULT 1, \
                    where_clause NVARCHAR(MAX), \
                    change_detection_strategy NVARCHAR(50), \
                    rowversion_column NVARCHAR(128), \
                    last_rowversion_synced BINARY(8), \
                    last_hash_synced NVARCHAR(64), \
                    last_sync_date DATETIME2, \
                    last_sync_status NVARCHAR(50), \
                    records_inserted INT DEFAULT 0, \
                    records_updated INT DEFAULT 0, \
                    records_deleted INT DEFAULT 0, \
                    last_error_message NVARCHAR(MAX), \
                    last_error_date DATETIME2, \
                    created_date DATETIME2 DEFAULT GETDATE(), \
                    modified_date DATETIME2 DEFAULT GETDATE(), \
                    CONSTRAINT UQ_SyncMetadata_Table UNIQUE (schema_name, table_name) \
                ); \
                CREATE INDEX IX_SyncMetadata_LastSync ON {qualified}(last_sync_date DESC); \
            END",
            schema = escape_string_literal(&self.schema),
            table = escape_string_literal(&self.table),
            qualified = qualified,
        );

        dest.execute(&script, &[])
            .await
            .map_err(|e| Error::ledger(format!("ensure {}: {}", qualified, e)))?;
        info!("ledger table {} verified", qualified);
        Ok(())
    }

    /// Load the entry for one table, if present.
    pub async fn load(
        &self,
        dest: &mut SqlServerClient,
        table: &TableRef,
    ) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE schema_name = @P1 AND table_name = @P2",
            SELECT_COLUMNS,
            self.qualified()
        );
        let row = dest
            .query_one(
                &sql,
                &[
                    Value::String(table.schema.clone()),
                    Value::String(table.name.clone()),
                ],
            )
            .await
            .map_err(|e| Error::ledger(e.to_string()))?;

        row.map(|r| parse_entry(&r)).transpose()
    }

    /// Create or refresh the configuration half of a table's entry.
    #[allow(clippy::too_many_arguments)]
    pub async fn initialize(
        &self,
        dest: &mut SqlServerClient,
        table: &TableRef,
        pk_columns: &[String],
        pk_auto_detected: bool,
        where_clause: Option<&str>,
        strategy: LedgerStrategy,
        rowversion_column: Option<&str>,
    ) -> Result<()> {
        let sql = format!(
            "MERGE {} AS target \
             USING (SELECT @P1 AS schema_name, @P2 AS table_name) AS source \
             ON target.schema_name = source.schema_name \
                AND target.table_name = source.table_name \
             WHEN MATCHED THEN UPDATE SET \
                primary_key_columns = @P3, \
                pk_auto_detected = @P4, \
                where_clause = @P5, \
                change_detection_strategy = @P6, \
                rowversion_column = @P7, \
                modified_date = GETDATE() \
             WHEN NOT MATCHED THEN INSERT \
                (schema_name, table_name, primary_key_columns, pk_auto_detected, \
                 where_clause, change_detection_strategy, rowversion_column) \
                VALUES (@P1, @P2, @P3, @P4, @P5, @P6, @P7);",
            self.qualified()
        );

        dest.execute(
            &sql,
            &[
                Value::String(table.schema.clone()),
                Value::String(table.name.clone()),
                Value::String(pk_columns.join(",")),
                Value::Bool(pk_auto_detected),
                Value::from(where_clause.map(str::to_owned)),
                Value::String(strategy.as_str().to_string()),
                Value::from(rowversion_column.map(str::to_owned)),
            ],
        )
        .await
        .map_err(|e| Error::ledger(e.to_string()))?;

        debug!("ledger entry initialized for {}", table);
        Ok(())
    }

    /// Mark the table as running. Own short statement, outside any data
    /// transaction.
    pub async fn record_start(&self, dest: &mut SqlServerClient, table: &TableRef) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET last_sync_status = @P1, modified_date = GETDATE() \
             WHERE schema_name = @P2 AND table_name = @P3",
            self.qualified()
        );
        dest.execute(
            &sql,
            &[
                Value::String(SyncStatus::Running.as_str().to_string()),
                Value::String(table.schema.clone()),
                Value::String(table.name.clone()),
            ],
        )
        .await
        .map_err(|e| Error::ledger(e.to_string()))?;
        Ok(())
    }

    /// Record a successful sync.
    ///
    /// Must be called on the destination client while the table's data
    /// transaction is open; a rollback then discards this update too.
    /// The high-water mark only moves forward: the stored value is kept
    /// when it already exceeds the new one.
    pub async fn record_success(
        &self,
        dest: &mut SqlServerClient,
        table: &TableRef,
        counters: SyncCounters,
        strategy: LedgerStrategy,
        new_rowversion: Option<RowVersion>,
    ) -> Result<()> {
        let mut params = vec![
            Value::String(strategy.as_str().to_string()),
            Value::Int32(clamp_counter(counters.inserted)),
            Value::Int32(clamp_counter(counters.updated)),
            Value::Int32(clamp_counter(counters.deleted)),
            Value::String(table.schema.clone()),
            Value::String(table.name.clone()),
        ];

        // The high-water clause only exists under the rowversion strategy;
        // the CASE keeps the stored mark monotonically non-decreasing.
        let rowversion_clause = match new_rowversion {
            Some(rv) => {
                params.push(Value::Bytes(rv.as_bytes().to_vec()));
                "last_rowversion_synced = CASE \
                    WHEN last_rowversion_synced IS NULL OR @P7 > last_rowversion_synced \
                    THEN @P7 ELSE last_rowversion_synced END, "
            }
            None => "",
        };

        let sql = format!(
            "UPDATE {} SET \
                last_sync_date = GETDATE(), \
                last_sync_status = 'OK', \
                change_detection_strategy = @P1, \
                records_inserted = records_inserted + @P2, \
                records_updated = records_updated + @P3, \
                records_deleted = records_deleted + @P4, \
                {}last_error_message = NULL, \
                modified_date = GETDATE() \
             WHERE schema_name = @P5 AND table_name = @P6",
            self.qualified(),
            rowversion_clause
        );

        dest.execute(&sql, &params)
            .await
            .map(|_| ())
            .map_err(|e| Error::ledger(e.to_string()))
    }

    /// Record a failed sync. Own short statement; the data transaction has
    /// already been rolled back, so counters report zero applied.
    pub async fn record_error(
        &self,
        dest: &mut SqlServerClient,
        table: &TableRef,
        message: &str,
    ) -> Result<()> {
        self.record_failure(dest, table, SyncStatus::Error, message)
            .await
    }

    /// Record a cancellation that rolled back the in-flight table.
    pub async fn record_canceled(
        &self,
        dest: &mut SqlServerClient,
        table: &TableRef,
    ) -> Result<()> {
        self.record_failure(dest, table, SyncStatus::Partial, "canceled")
            .await
    }

    async fn record_failure(
        &self,
        dest: &mut SqlServerClient,
        table: &TableRef,
        status: SyncStatus,
        message: &str,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET \
                last_sync_date = GETDATE(), \
                last_sync_status = @P1, \
                last_error_message = @P2, \
                last_error_date = GETDATE(), \
                modified_date = GETDATE() \
             WHERE schema_name = @P3 AND table_name = @P4",
            self.qualified()
        );
        dest.execute(
            &sql,
            &[
                Value::String(status.as_str().to_string()),
                Value::String(message.to_string()),
                Value::String(table.schema.clone()),
                Value::String(table.name.clone()),
            ],
        )
        .await
        .map(|_| ())
        .map_err(|e| Error::ledger(e.to_string()))
    }

    /// Null the high-water mark and zero counters, forcing the next run to
    /// process all rows.
    pub async fn reset(&self, dest: &mut SqlServerClient, table: &TableRef) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET \
                last_rowversion_synced = NULL, \
                last_hash_synced = NULL, \
                records_inserted = 0, \
                records_updated = 0, \
                records_deleted = 0, \
                last_error_message = NULL, \
                last_error_date = NULL, \
                modified_date = GETDATE() \
             WHERE schema_name = @P1 AND table_name = @P2",
            self.qualified()
        );
        dest.execute(
            &sql,
            &[
                Value::String(table.schema.clone()),
                Value::String(table.name.clone()),
            ],
        )
        .await
        .map_err(|e| Error::ledger(e.to_string()))?;
        info!("ledger entry reset for {}", table);
        Ok(())
    }

    /// All ledger entries, most recently synced first.
    pub async fn summary(&self, dest: &mut SqlServerClient) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY last_sync_date DESC",
            SELECT_COLUMNS,
            self.qualified()
        );
        let rows = dest
            .query(&sql, &[])
            .await
            .map_err(|e| Error::ledger(e.to_string()))?;
        rows.iter().map(parse_entry).collect()
    }
}

fn clamp_counter(n: u64) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn parse_entry(row: &Row) -> Result<LedgerEntry> {
    let schema = opt_string(row, "schema_name")
        .ok_or_else(|| Error::ledger("ledger row missing schema_name"))?;
    let name = opt_string(row, "table_name")
        .ok_or_else(|| Error::ledger("ledger row missing table_name"))?;

    let primary_key_columns = opt_string(row, "primary_key_columns")
        .map(|s| {
            s.split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let last_rowversion_synced = match row.get_by_name("last_rowversion_synced") {
        Some(Value::Bytes(b)) => RowVersion::from_slice(b),
        _ => None,
    };

    Ok(LedgerEntry {
        table: TableRef::new(schema, name),
        primary_key_columns,
        pk_auto_detected: row
            .get_by_name("pk_auto_detected")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        where_clause: opt_string(row, "where_clause"),
        strategy: opt_string(row, "change_detection_strategy")
            .and_then(|s| LedgerStrategy::parse(&s)),
        rowversion_column: opt_string(row, "rowversion_column"),
        last_rowversion_synced,
        last_hash_synced: opt_string(row, "last_hash_synced"),
        last_sync_date: opt_datetime(row, "last_sync_date"),
        last_sync_status: opt_string(row, "last_sync_status").and_then(|s| SyncStatus::parse(&s)),
        records_inserted: opt_i32(row, "records_inserted"),
        records_updated: opt_i32(row, "records_updated"),
        records_deleted: opt_i32(row, "records_deleted"),
        last_error_message: opt_string(row, "last_error_message"),
        last_error_date: opt_datetime(row, "last_error_date"),
        created_date: opt_datetime(row, "created_date"),
        modified_date: opt_datetime(row, "modified_date"),
    })
}

fn opt_string(row: &Row, name: &str) -> Option<String> {
    match row.get_by_name(name) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn opt_datetime(row: &Row, name: &str) -> Option<NaiveDateTime> {
    row.get_by_name(name).and_then(Value::as_datetime)
}

fn opt_i32(row: &Row, name: &str) -> i32 {
    row.get_by_name(name)
        .and_then(Value::as_i64)
        .unwrap_or(0) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        Ledger::new(&SyncOptions::default()).unwrap()
    }

    #[test]
    fn test_qualified_name() {
        assert_eq!(ledger().qualified(), "[dbo].[SyncMetadata]");
    }

    #[test]
    fn test_rejects_invalid_names() {
        let mut options = SyncOptions::default();
        options.ledger_table = "bad]name; DROP".into();
        assert!(Ledger::new(&options).is_err());
    }

    #[test]
    fn test_strategy_labels_round_trip() {
        for s in [
            LedgerStrategy::RowVersion,
            LedgerStrategy::Hash,
            LedgerStrategy::Initial,
        ] {
            assert_eq!(LedgerStrategy::parse(s.as_str()), Some(s));
        }
        assert_eq!(LedgerStrategy::parse("bogus"), None);
    }

    #[test]
    fn test_status_labels_round_trip() {
        for s in [
            SyncStatus::Ok,
            SyncStatus::Partial,
            SyncStatus::Error,
            SyncStatus::Running,
        ] {
            assert_eq!(SyncStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SyncStatus::parse(""), None);
    }

    #[test]
    fn test_counters_total() {
        let counters = SyncCounters {
            inserted: 3,
            updated: 2,
            deleted: 1,
        };
        assert_eq!(counters.total(), 6);
        assert_eq!(SyncCounters::default().total(), 0);
    }

    #[test]
    fn test_counter_clamp() {
        assert_eq!(clamp_counter(42), 42);
        assert_eq!(clamp_counter(u64::MAX), i32::MAX);
    }

    #[test]
    fn test_parse_entry_full_row() {
        let row = Row::new(
            vec![
                "schema_name".into(),
                "table_name".into(),
                "primary_key_columns".into(),
                "pk_auto_detected".into(),
                "where_clause".into(),
                "change_detection_strategy".into(),
                "rowversion_column".into(),
                "last_rowversion_synced".into(),
                "last_sync_status".into(),
                "records_inserted".into(),
            ],
            vec![
                Value::String("dbo".into()),
                Value::String("Customer".into()),
                Value::String("Id,Region".into()),
                Value::Bool(false),
                Value::String("Sucursal = 1".into()),
                Value::String("ROWVERSION".into()),
                Value::String("RV".into()),
                Value::Bytes(vec![0, 0, 0, 0, 0, 0, 0, 9]),
                Value::String("OK".into()),
                Value::Int32(12),
            ],
        );

        let entry = parse_entry(&row).unwrap();
        assert_eq!(entry.table, TableRef::new("dbo", "Customer"));
        assert_eq!(
            entry.primary_key_columns,
            vec!["Id".to_string(), "Region".to_string()]
        );
        assert!(!entry.pk_auto_detected);
        assert_eq!(entry.where_clause.as_deref(), Some("Sucursal = 1"));
        assert_eq!(entry.strategy, Some(LedgerStrategy::RowVersion));
        assert_eq!(entry.rowversion_column.as_deref(), Some("RV"));
        assert_eq!(
            entry.last_rowversion_synced,
            Some(RowVersion::new([0, 0, 0, 0, 0, 0, 0, 9]))
        );
        assert_eq!(entry.last_sync_status, Some(SyncStatus::Ok));
        assert_eq!(entry.records_inserted, 12);
    }

    #[test]
    fn test_parse_entry_minimal_row() {
        let row = Row::new(
            vec!["schema_name".into(), "table_name".into()],
            vec![
                Value::String("dbo".into()),
                Value::String("Orphan".into()),
            ],
        );
        let entry = parse_entry(&row).unwrap();
        assert!(entry.primary_key_columns.is_empty());
        assert!(entry.pk_auto_detected);
        assert!(entry.strategy.is_none());
        assert!(entry.last_rowversion_synced.is_none());
        assert_eq!(entry.records_inserted, 0);
    }

    #[test]
    fn test_parse_entry_rejects_nameless_row() {
        let row = Row::new(vec!["other".into()], vec![Value::Int32(1)]);
        assert!(parse_entry(&row).is_err());
    }
}
