//! Batch application of computed deltas.
//!
//! One transaction per table. Within it the order is strict:
//! DELETEs first (so a primary key reused at the source never collides
//! with a stale destination row), then UPDATEs, then INSERTs. The ledger
//! success row is written through the same open transaction, so commit is
//! all-or-nothing for data and bookkeeping alike.
//!
//! Identity values are preserved verbatim: when the table has an identity
//! column, inserts run under `SET IDENTITY_INSERT ... ON`.

use crate::catalog::TableSchema;
use crate::client::SqlServerClient;
use crate::delta::TableDelta;
use crate::error::Error;
use crate::event::{BatchKind, CancelFlag, EventSender, SyncEvent};
use crate::ledger::{Ledger, SyncCounters};
use crate::security::quote_identifier;
use crate::strategy::ChangeStrategy;
use crate::types::{Key, Row, TableRef, Value};
use crate::Result;
use tracing::{debug, info, warn};

/// Applies one table's delta inside a single destination transaction.
pub struct BatchApplier<'a> {
    source: &'a mut SqlServerClient,
    dest: &'a mut SqlServerClient,
    batch_size: usize,
    events: &'a EventSender,
    cancel: &'a CancelFlag,
}

impl<'a> BatchApplier<'a> {
    /// Create an applier over a worker's connection pair.
    pub fn new(
        source: &'a mut SqlServerClient,
        dest: &'a mut SqlServerClient,
        batch_size: usize,
        events: &'a EventSender,
        cancel: &'a CancelFlag,
    ) -> Self {
        Self {
            source,
            dest,
            batch_size: batch_size.max(1),
            events,
            cancel,
        }
    }

    /// Apply the delta and record success, all within one transaction.
    ///
    /// On any error the transaction is rolled back and zero writes count;
    /// the caller records the failure to the ledger separately.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply(
        &mut self,
        schema: &TableSchema,
        pk: &[String],
        filter: Option<&str>,
        delta: &TableDelta,
        ledger: &Ledger,
        strategy: &ChangeStrategy,
    ) -> Result<SyncCounters> {
        let table = schema.table.clone();

        // Full rows are only needed for inserts and updates; deletes are
        // key-only. Fetched before the transaction opens so the write
        // window stays as short as possible.
        let (insert_rows, update_rows) = if delta.inserts.is_empty() && delta.updates.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            self.fetch_candidate_rows(schema, pk, filter, delta).await?
        };

        self.dest
            .begin_transaction()
            .await
            .map_err(|e| Error::apply(table.to_string(), e.to_string()))?;

        let result = self
            .apply_in_transaction(schema, pk, delta, insert_rows, update_rows, ledger, strategy)
            .await;

        match result {
            Ok(counters) => {
                self.dest
                    .commit()
                    .await
                    .map_err(|e| Error::apply(table.to_string(), e.to_string()))?;
                info!(
                    "{}: committed {} inserts, {} updates, {} deletes",
                    table, counters.inserted, counters.updated, counters.deleted
                );
                Ok(counters)
            }
            Err(e) => {
                self.dest.rollback_quietly().await;
                Err(e)
            }
        }
    }

    async fn apply_in_transaction(
        &mut self,
        schema: &TableSchema,
        pk: &[String],
        delta: &TableDelta,
        insert_rows: Vec<Row>,
        update_rows: Vec<Row>,
        ledger: &Ledger,
        strategy: &ChangeStrategy,
    ) -> Result<SyncCounters> {
        let table = schema.table.clone();
        let mut counters = SyncCounters::default();

        // 1. DELETEs
        let delete_stmt = delete_sql(&table, pk);
        for batch in delta.deletes.chunks(self.batch_size) {
            self.cancel.check()?;
            for key in batch {
                self.dest
                    .execute(&delete_stmt, key.values())
                    .await
                    .map_err(|e| Error::apply(table.to_string(), e.to_string()))?;
            }
            counters.deleted += batch.len() as u64;
            self.events
                .emit(SyncEvent::BatchApplied {
                    table: table.clone(),
                    kind: BatchKind::Delete,
                    rows: batch.len() as u64,
                })
                .await;
        }

        // 2. UPDATEs
        let set_columns = update_set_columns(schema, pk);
        if set_columns.is_empty() && !update_rows.is_empty() {
            // Nothing assignable outside the key (and identity, which
            // UPDATE may never touch); rows on both sides stay as they are.
            debug!("{}: no assignable columns, skipping updates", table);
        } else {
            let update_stmt = update_sql(&table, pk, &set_columns);
            for batch in update_rows.chunks(self.batch_size) {
                self.cancel.check()?;
                for row in batch {
                    let params = update_params(row, pk, &set_columns);
                    self.dest
                        .execute(&update_stmt, &params)
                        .await
                        .map_err(|e| Error::apply(table.to_string(), e.to_string()))?;
                }
                counters.updated += batch.len() as u64;
                self.events
                    .emit(SyncEvent::BatchApplied {
                        table: table.clone(),
                        kind: BatchKind::Update,
                        rows: batch.len() as u64,
                    })
                    .await;
            }
        }

        // 3. INSERTs, preserving identity values verbatim
        let data_columns = schema.data_column_names();
        let has_identity = schema.identity_column().is_some();
        if !insert_rows.is_empty() {
            if has_identity {
                self.dest
                    .execute(&identity_insert_sql(&table, true), &[])
                    .await
                    .map_err(|e| Error::apply(table.to_string(), e.to_string()))?;
            }

            let insert_stmt = insert_sql(&table, &data_columns);
            for batch in insert_rows.chunks(self.batch_size) {
                self.cancel.check()?;
                for row in batch {
                    let params = ordered_params(row, &data_columns);
                    self.dest
                        .execute(&insert_stmt, &params)
                        .await
                        .map_err(|e| Error::apply(table.to_string(), e.to_string()))?;
                }
                counters.inserted += batch.len() as u64;
                self.events
                    .emit(SyncEvent::BatchApplied {
                        table: table.clone(),
                        kind: BatchKind::Insert,
                        rows: batch.len() as u64,
                    })
                    .await;
            }

            if has_identity {
                self.dest
                    .execute(&identity_insert_sql(&table, false), &[])
                    .await
                    .map_err(|e| Error::apply(table.to_string(), e.to_string()))?;
            }
        }

        // 4. Ledger success row rides the same transaction
        ledger
            .record_success(
                self.dest,
                &table,
                counters,
                strategy.success_label(),
                delta.high_water,
            )
            .await?;

        Ok(counters)
    }

    /// Fetch the full source rows backing the INSERT and UPDATE key sets.
    ///
    /// One filtered scan, partitioned against the sorted key sets. Keys
    /// that vanished from the source between detection and this scan are
    /// dropped with a warning; the next run reconciles them.
    async fn fetch_candidate_rows(
        &mut self,
        schema: &TableSchema,
        pk: &[String],
        filter: Option<&str>,
        delta: &TableDelta,
    ) -> Result<(Vec<Row>, Vec<Row>)> {
        let table = &schema.table;
        let columns = schema.data_column_names();
        let column_list = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let order = pk
            .iter()
            .map(|c| format!("{} ASC", quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let where_sql = match filter {
            Some(predicate) => format!(" WHERE ({})", predicate),
            None => String::new(),
        };
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY {}",
            column_list,
            table.qualified(),
            where_sql,
            order
        );

        let rows = self
            .source
            .query(&sql, &[])
            .await
            .map_err(|e| Error::apply(table.to_string(), e.to_string()))?;

        let mut keyed: Vec<(Key, Row)> = rows
            .into_iter()
            .map(|row| (row_key(&row, pk), row))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let (insert_rows, update_rows) =
            partition_candidates(keyed, &delta.inserts, &delta.updates);

        if insert_rows.len() != delta.inserts.len() || update_rows.len() != delta.updates.len() {
            warn!(
                "{}: {} candidate rows disappeared from the source between scans",
                table,
                (delta.inserts.len() - insert_rows.len()) + (delta.updates.len() - update_rows.len())
            );
        }

        Ok((insert_rows, update_rows))
    }
}

/// Columns an UPDATE statement may assign: data columns minus the key and
/// minus any identity column. SQL Server never allows assigning an identity
/// column in UPDATE; `IDENTITY_INSERT` only governs INSERT.
pub(crate) fn update_set_columns(schema: &TableSchema, pk: &[String]) -> Vec<String> {
    let identity = schema.identity_column().map(|c| c.name.clone());
    schema
        .data_column_names()
        .into_iter()
        .filter(|c| !pk.iter().any(|p| p.eq_ignore_ascii_case(c)))
        .filter(|c| {
            identity
                .as_deref()
                .map_or(true, |i| !i.eq_ignore_ascii_case(c))
        })
        .collect()
}

/// Select the rows whose keys appear in the insert/update sets.
///
/// All three inputs must be sorted ascending by key.
pub(crate) fn partition_candidates(
    rows: Vec<(Key, Row)>,
    inserts: &[Key],
    updates: &[Key],
) -> (Vec<Row>, Vec<Row>) {
    let mut insert_rows = Vec::with_capacity(inserts.len());
    let mut update_rows = Vec::with_capacity(updates.len());
    let mut ins = inserts.iter().peekable();
    let mut upd = updates.iter().peekable();

    for (key, row) in rows {
        while let Some(next) = ins.peek() {
            if **next < key {
                ins.next();
            } else {
                break;
            }
        }
        while let Some(next) = upd.peek() {
            if **next < key {
                upd.next();
            } else {
                break;
            }
        }
        if ins.peek().map(|k| **k == key).unwrap_or(false) {
            ins.next();
            insert_rows.push(row);
        } else if upd.peek().map(|k| **k == key).unwrap_or(false) {
            upd.next();
            update_rows.push(row);
        }
    }

    (insert_rows, update_rows)
}

/// Extract the PK tuple from a fetched row.
fn row_key(row: &Row, pk: &[String]) -> Key {
    Key(pk
        .iter()
        .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
        .collect())
}

fn pk_predicate(pk: &[String], first_param: usize) -> String {
    pk.iter()
        .enumerate()
        .map(|(i, c)| format!("{} = @P{}", quote_identifier(c), first_param + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `DELETE` statement keyed by the full PK tuple.
pub(crate) fn delete_sql(table: &TableRef, pk: &[String]) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        table.qualified(),
        pk_predicate(pk, 1)
    )
}

/// `UPDATE` statement setting every non-key data column.
pub(crate) fn update_sql(table: &TableRef, pk: &[String], set_columns: &[String]) -> String {
    let set_list = set_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = @P{}", quote_identifier(c), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {} WHERE {}",
        table.qualified(),
        set_list,
        pk_predicate(pk, set_columns.len() + 1)
    )
}

/// `INSERT` statement over the data columns.
pub(crate) fn insert_sql(table: &TableRef, columns: &[String]) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("@P{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.qualified(),
        column_list,
        placeholders
    )
}

/// `SET IDENTITY_INSERT` toggle.
pub(crate) fn identity_insert_sql(table: &TableRef, on: bool) -> String {
    format!(
        "SET IDENTITY_INSERT {} {}",
        table.qualified(),
        if on { "ON" } else { "OFF" }
    )
}

/// Parameters for [`update_sql`]: SET values first, then the key.
fn update_params(row: &Row, pk: &[String], set_columns: &[String]) -> Vec<Value> {
    let mut params: Vec<Value> = set_columns
        .iter()
        .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
        .collect();
    params.extend(
        pk.iter()
            .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null)),
    );
    params
}

/// Parameters for [`insert_sql`] in declared column order.
fn ordered_params(row: &Row, columns: &[String]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
        .collect()
}
