//! Run and per-table configuration.
//!
//! [`SyncOptions`] holds run-wide knobs (batch size, parallelism, timeouts,
//! ledger placement); [`TableSyncConfig`] selects one table and optionally
//! overrides its primary key or restricts its rows with a filter predicate.

use crate::error::Error;
use crate::security::validate_identifier;
use crate::types::TableRef;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_batch_size() -> usize {
    1000
}

fn default_max_parallel_tables() -> usize {
    5
}

fn default_connection_timeout_secs() -> u64 {
    30
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_ledger_schema() -> String {
    "dbo".to_string()
}

fn default_ledger_table() -> String {
    "SyncMetadata".to_string()
}

fn default_event_buffer() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

/// Run-wide synchronization options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Rows per write batch (default: 1000)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum tables synchronized concurrently (default: 5).
    /// `1` forces fully sequential processing on a single connection pair.
    #[serde(default = "default_max_parallel_tables")]
    pub max_parallel_tables: usize,

    /// Connection open timeout in seconds (default: 30)
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Per-command timeout in seconds (default: 300)
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Schema holding the sync ledger table (default: `dbo`)
    #[serde(default = "default_ledger_schema")]
    pub ledger_schema: String,

    /// Name of the sync ledger table (default: `SyncMetadata`)
    #[serde(default = "default_ledger_table")]
    pub ledger_table: String,

    /// Progress event channel capacity (default: 1024)
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_parallel_tables: default_max_parallel_tables(),
            connection_timeout_secs: default_connection_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            ledger_schema: default_ledger_schema(),
            ledger_table: default_ledger_table(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl SyncOptions {
    /// Connection open timeout as a [`Duration`].
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Per-command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        if self.max_parallel_tables == 0 {
            return Err(Error::config("max_parallel_tables must be > 0"));
        }
        if self.connection_timeout_secs == 0 {
            return Err(Error::config("connection_timeout_secs must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(Error::config("command_timeout_secs must be > 0"));
        }
        if self.event_buffer == 0 {
            return Err(Error::config("event_buffer must be > 0"));
        }
        validate_identifier(&self.ledger_schema)?;
        validate_identifier(&self.ledger_table)?;
        Ok(())
    }
}

/// Per-table synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSyncConfig {
    /// The table to synchronize
    pub table: TableRef,

    /// Explicit primary-key columns, overriding catalog detection.
    /// Every named column must exist at the source.
    #[serde(default)]
    pub primary_key_override: Option<Vec<String>>,

    /// Boolean SQL predicate over source columns, applied symmetrically to
    /// both sides of every row scan (no leading `WHERE`).
    #[serde(default)]
    pub row_filter: Option<String>,

    /// Whether the user selected this table for the run (default: true)
    #[serde(default = "default_true")]
    pub selected: bool,
}

impl TableSyncConfig {
    /// Configure a table with catalog-detected PK and no filter.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            table: TableRef::new(schema, table),
            primary_key_override: None,
            row_filter: None,
            selected: true,
        }
    }

    /// Override the primary-key columns.
    pub fn with_primary_key(mut self, columns: Vec<String>) -> Self {
        self.primary_key_override = Some(columns);
        self
    }

    /// Restrict the row scope with a boolean SQL predicate.
    pub fn with_row_filter(mut self, predicate: impl Into<String>) -> Self {
        self.row_filter = Some(predicate.into());
        self
    }

    /// Mark the table deselected (kept in the list, skipped by the run).
    pub fn deselected(mut self) -> Self {
        self.selected = false;
        self
    }

    /// Validate the static parts of the configuration.
    ///
    /// Existence of override columns at the source is checked later, against
    /// the live catalog.
    pub fn validate(&self) -> crate::Result<()> {
        validate_identifier(&self.table.schema)?;
        validate_identifier(&self.table.name)?;
        if let Some(cols) = &self.primary_key_override {
            if cols.is_empty() {
                return Err(Error::config(format!(
                    "{}: primary-key override must name at least one column",
                    self.table
                )));
            }
            for col in cols {
                validate_identifier(col)?;
            }
        }
        if let Some(filter) = &self.row_filter {
            if filter.trim().is_empty() {
                return Err(Error::config(format!(
                    "{}: row filter must not be blank",
                    self.table
                )));
            }
        }
        Ok(())
    }
}
