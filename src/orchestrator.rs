//! The table orchestrator: drives a whole run end-to-end.
//!
//! For each selected table: resolve the effective primary key, mirror the
//! structure if the destination lacks it, bootstrap the ledger entry,
//! select a strategy, compute the delta, and apply it transactionally,
//! emitting progress events throughout.
//!
//! Scheduling follows the foreign-key DAG: base structures are created in
//! dependency order with every FK deferred to the end, and data flows
//! referenced-before-referencer. Independent tables within one level may
//! run in parallel, each worker on its own connection pair, bounded by
//! `max_parallel_tables`.
//!
//! Errors are scoped to a single table: record to the ledger, emit
//! `TableFailed`, continue. Only a run-level connection failure aborts
//! everything. Cancellation stops further scheduling; the in-flight table
//! rolls back and committed tables keep their ledger entries.

use crate::apply::BatchApplier;
use crate::catalog::{CatalogReader, TableSchema};
use crate::client::{ClientProvider, SqlServerClient};
use crate::config::{SyncOptions, TableSyncConfig};
use crate::ddl;
use crate::delta::DeltaComputer;
use crate::error::Error;
use crate::event::{CancelFlag, EventSender, RunSummary, SyncEvent};
use crate::ledger::{Ledger, SyncCounters};
use crate::strategy;
use crate::types::TableRef;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Lifecycle of one table within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Not yet processed
    Pending,
    /// Destination structure verified or created
    SchemaReady,
    /// Ledger entry exists and the run was recorded as started
    LedgerReady,
    /// Delta computed, writes in flight
    Applying,
    /// Converged and committed
    Done,
    /// Failed or rolled back by cancellation
    Failed,
}

/// Outcome of one table after events and ledger bookkeeping.
enum TableOutcome {
    Ok,
    Failed,
    Canceled,
}

/// Drives synchronization runs.
pub struct SyncRunner {
    options: SyncOptions,
    provider: Arc<dyn ClientProvider>,
    cancel: CancelFlag,
    events: EventSender,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncRunner {
    /// Create a runner. Fails on invalid options.
    pub fn new(options: SyncOptions, provider: Arc<dyn ClientProvider>) -> Result<Self> {
        options.validate()?;
        let (events, event_rx) = EventSender::channel(options.event_buffer);
        Ok(Self {
            options,
            provider,
            cancel: CancelFlag::new(),
            events,
            event_rx: Some(event_rx),
        })
    }

    /// Take the progress event receiver (can only be taken once).
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// A handle for requesting cooperative cancellation.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Synchronize the selected tables.
    ///
    /// Returns the run summary; a partial run (some tables failed, or the
    /// run was canceled) is a normal `Ok` outcome. Only run-level failures
    /// (invalid config, planning connection lost) return `Err`.
    pub async fn run(&mut self, tables: &[TableSyncConfig]) -> Result<RunSummary> {
        for config in tables {
            config.validate()?;
        }
        let selected: Vec<&TableSyncConfig> = tables.iter().filter(|t| t.selected).collect();

        let mut summary = RunSummary {
            tables_total: selected.len(),
            ..RunSummary::default()
        };
        if selected.is_empty() {
            return Ok(summary);
        }

        info!("starting sync run over {} tables", selected.len());

        // Planning connections; losing these aborts the run.
        let mut source = self.provider.connect_source().await?;
        let mut dest = self.provider.connect_dest().await?;
        source.set_command_timeout(self.options.command_timeout());
        dest.set_command_timeout(self.options.command_timeout());

        let ledger = Ledger::new(&self.options)?;
        ledger.ensure(&mut dest).await?;

        let mut states: HashMap<TableRef, TableState> = selected
            .iter()
            .map(|c| (c.table.clone(), TableState::Pending))
            .collect();

        // Read every source schema up front: it feeds dependency ordering,
        // mirroring, and the delta engine alike.
        let mut schemas: HashMap<TableRef, TableSchema> = HashMap::new();
        for config in &selected {
            match CatalogReader::read(&mut source, &config.table).await {
                Ok(schema) => {
                    schemas.insert(config.table.clone(), schema);
                }
                Err(e) => {
                    self.fail_table(&mut dest, &ledger, &config.table, &e).await;
                    states.insert(config.table.clone(), TableState::Failed);
                    summary.tables_failed += 1;
                }
            }
        }

        // Dependency levels over the tables that survived the catalog read.
        let graph: Vec<(TableRef, Vec<TableRef>)> = selected
            .iter()
            .filter(|c| schemas.contains_key(&c.table))
            .map(|c| {
                let refs = schemas[&c.table]
                    .referenced_tables()
                    .into_iter()
                    .cloned()
                    .collect();
                (c.table.clone(), refs)
            })
            .collect();
        let levels = ddl::dependency_levels(&graph);

        // Phase 1: mirror missing structures, FKs after all creates.
        if let Err(e) = self
            .mirror_missing(&mut dest, &ledger, &levels, &schemas, &mut states, &mut summary)
            .await
        {
            if matches!(e, Error::Canceled) {
                return Ok(summary);
            }
            return Err(e);
        }

        // Phase 2: per-table delta sync, level by level.
        for level in &levels {
            if self.cancel.is_canceled() {
                info!("cancellation observed; no further tables scheduled");
                break;
            }

            let runnable: Vec<&TableSyncConfig> = level
                .iter()
                .filter(|t| states.get(*t) == Some(&TableState::SchemaReady))
                .filter_map(|t| selected.iter().find(|c| &c.table == t).copied())
                .collect();
            if runnable.is_empty() {
                continue;
            }

            let outcomes = if self.options.max_parallel_tables == 1 {
                self.run_level_sequential(&mut source, &mut dest, &ledger, &runnable, &schemas)
                    .await
            } else {
                self.run_level_parallel(&ledger, &runnable, &schemas).await
            };

            let mut canceled = false;
            for (table, outcome) in outcomes {
                match outcome {
                    TableOutcome::Ok => {
                        states.insert(table, TableState::Done);
                        summary.tables_ok += 1;
                    }
                    TableOutcome::Failed => {
                        states.insert(table, TableState::Failed);
                        summary.tables_failed += 1;
                    }
                    TableOutcome::Canceled => {
                        states.insert(table, TableState::Failed);
                        summary.tables_failed += 1;
                        canceled = true;
                    }
                }
            }
            if canceled {
                break;
            }
        }

        info!(
            "sync run finished: {}/{} ok, {} failed",
            summary.tables_ok, summary.tables_total, summary.tables_failed
        );
        Ok(summary)
    }

    /// Create base structures for missing destination tables in dependency
    /// order, then add every foreign key. Cycle-proof by construction.
    async fn mirror_missing(
        &self,
        dest: &mut SqlServerClient,
        ledger: &Ledger,
        levels: &[Vec<TableRef>],
        schemas: &HashMap<TableRef, TableSchema>,
        states: &mut HashMap<TableRef, TableState>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut created: Vec<TableRef> = Vec::new();

        for level in levels {
            for table in level {
                self.cancel.check()?;
                let Some(schema) = schemas.get(table) else {
                    continue;
                };

                let exists = match CatalogReader::table_exists(dest, table).await {
                    Ok(exists) => exists,
                    Err(e) => {
                        self.fail_table(dest, ledger, table, &e).await;
                        states.insert(table.clone(), TableState::Failed);
                        summary.tables_failed += 1;
                        continue;
                    }
                };

                if exists {
                    // No drift reconciliation: an existing table is taken
                    // as structurally current.
                    states.insert(table.clone(), TableState::SchemaReady);
                    continue;
                }

                debug!("{}: missing at destination, creating mirror", table);
                let mut failed = false;
                for statement in ddl::table_statements(schema) {
                    if let Err(e) = dest.execute(&statement, &[]).await {
                        let err = Error::ddl(table.to_string(), e.to_string());
                        self.fail_table(dest, ledger, table, &err).await;
                        states.insert(table.clone(), TableState::Failed);
                        summary.tables_failed += 1;
                        failed = true;
                        break;
                    }
                }
                if failed {
                    continue;
                }

                created.push(table.clone());
                states.insert(table.clone(), TableState::SchemaReady);
                self.events
                    .emit(SyncEvent::TableSchemaCreated {
                        table: table.clone(),
                    })
                    .await;
            }
        }

        // All FKs after all creates; a failure here fails the owning table.
        for table in &created {
            if states.get(table) != Some(&TableState::SchemaReady) {
                continue;
            }
            let Some(schema) = schemas.get(table) else {
                continue;
            };
            for statement in ddl::foreign_key_statements(schema) {
                if let Err(e) = dest.execute(&statement, &[]).await {
                    let err = Error::ddl(table.to_string(), e.to_string());
                    self.fail_table(dest, ledger, table, &err).await;
                    states.insert(table.clone(), TableState::Failed);
                    summary.tables_failed += 1;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn run_level_sequential(
        &self,
        source: &mut SqlServerClient,
        dest: &mut SqlServerClient,
        ledger: &Ledger,
        tables: &[&TableSyncConfig],
        schemas: &HashMap<TableRef, TableSchema>,
    ) -> Vec<(TableRef, TableOutcome)> {
        let mut outcomes = Vec::with_capacity(tables.len());
        for config in tables {
            if self.cancel.is_canceled() {
                break;
            }
            let schema = &schemas[&config.table];
            let outcome = run_table(
                source,
                dest,
                &self.options,
                ledger,
                *config,
                schema,
                &self.events,
                &self.cancel,
            )
            .await;
            let stop = matches!(outcome, TableOutcome::Canceled);
            outcomes.push((config.table.clone(), outcome));
            if stop {
                break;
            }
        }
        outcomes
    }

    async fn run_level_parallel(
        &self,
        ledger: &Ledger,
        tables: &[&TableSyncConfig],
        schemas: &HashMap<TableRef, TableSchema>,
    ) -> Vec<(TableRef, TableOutcome)> {
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel_tables));
        let mut set: JoinSet<(TableRef, TableOutcome)> = JoinSet::new();

        for config in tables {
            let permit_pool = Arc::clone(&semaphore);
            let provider = Arc::clone(&self.provider);
            let options = self.options.clone();
            let ledger = ledger.clone();
            let config: TableSyncConfig = (**config).clone();
            let schema = schemas[&config.table].clone();
            let events = self.events.clone();
            let cancel = self.cancel.clone();

            set.spawn(async move {
                let _permit = match permit_pool.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (config.table.clone(), TableOutcome::Failed),
                };
                if cancel.is_canceled() {
                    return (config.table.clone(), TableOutcome::Canceled);
                }

                // Each worker dials its own connection pair.
                let mut source = match provider.connect_source().await {
                    Ok(client) => client,
                    Err(e) => {
                        error!("{}: source connection failed: {}", config.table, e);
                        events
                            .emit(SyncEvent::TableFailed {
                                table: config.table.clone(),
                                kind: e.kind(),
                                error: e.to_string(),
                            })
                            .await;
                        return (config.table.clone(), TableOutcome::Failed);
                    }
                };
                let mut dest = match provider.connect_dest().await {
                    Ok(client) => client,
                    Err(e) => {
                        error!("{}: destination connection failed: {}", config.table, e);
                        events
                            .emit(SyncEvent::TableFailed {
                                table: config.table.clone(),
                                kind: e.kind(),
                                error: e.to_string(),
                            })
                            .await;
                        return (config.table.clone(), TableOutcome::Failed);
                    }
                };
                source.set_command_timeout(options.command_timeout());
                dest.set_command_timeout(options.command_timeout());

                let outcome = run_table(
                    &mut source,
                    &mut dest,
                    &options,
                    &ledger,
                    &config,
                    &schema,
                    &events,
                    &cancel,
                )
                .await;
                (config.table.clone(), outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(tables.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("table worker panicked: {}", e),
            }
        }
        outcomes
    }

    /// Record a table failure to the ledger (best effort) and emit the event.
    async fn fail_table(
        &self,
        dest: &mut SqlServerClient,
        ledger: &Ledger,
        table: &TableRef,
        err: &Error,
    ) {
        error!("{}: {}", table, err);
        if let Err(ledger_err) = ledger.record_error(dest, table, &err.to_string()).await {
            warn!("{}: recording error to ledger failed: {}", table, ledger_err);
        }
        self.events
            .emit(SyncEvent::TableFailed {
                table: table.clone(),
                kind: err.kind(),
                error: err.to_string(),
            })
            .await;
    }
}

/// Resolve the effective primary key for a table.
///
/// A supplied override wins when all of its columns exist at the source
/// and are writable; otherwise the catalog PK is used. Returns the key
/// columns (in the schema's own casing) and whether they were
/// auto-detected.
pub fn resolve_primary_key(
    schema: &TableSchema,
    config: &TableSyncConfig,
) -> Result<(Vec<String>, bool)> {
    if let Some(override_columns) = &config.primary_key_override {
        let mut resolved = Vec::with_capacity(override_columns.len());
        for name in override_columns {
            let column = schema.column(name).ok_or_else(|| Error::InvalidPkOverride {
                table: schema.table.to_string(),
                column: name.clone(),
            })?;
            if !column.is_writable() {
                // Computed and rowversion columns cannot key the applier's
                // writes.
                return Err(Error::InvalidPkOverride {
                    table: schema.table.to_string(),
                    column: name.clone(),
                });
            }
            resolved.push(column.name.clone());
        }
        return Ok((resolved, false));
    }

    match &schema.primary_key {
        Some(pk) => Ok((pk.column_names(), true)),
        None => Err(Error::NoPrimaryKey {
            table: schema.table.to_string(),
        }),
    }
}

/// Run one table end-to-end on a worker's connection pair, handling event
/// emission and ledger bookkeeping for every outcome.
#[allow(clippy::too_many_arguments)]
async fn run_table(
    source: &mut SqlServerClient,
    dest: &mut SqlServerClient,
    options: &SyncOptions,
    ledger: &Ledger,
    config: &TableSyncConfig,
    schema: &TableSchema,
    events: &EventSender,
    cancel: &CancelFlag,
) -> TableOutcome {
    let table = config.table.clone();

    match sync_table(
        source, dest, options, ledger, config, schema, events, cancel,
    )
    .await
    {
        Ok(counters) => {
            events
                .emit(SyncEvent::TableCompleted {
                    table,
                    inserted: counters.inserted,
                    updated: counters.updated,
                    deleted: counters.deleted,
                })
                .await;
            TableOutcome::Ok
        }
        Err(Error::Canceled) => {
            info!("{}: canceled, transaction rolled back", table);
            if let Err(e) = ledger.record_canceled(dest, &table).await {
                warn!("{}: recording cancellation failed: {}", table, e);
            }
            events
                .emit(SyncEvent::TableFailed {
                    table,
                    kind: crate::error::ErrorKind::Canceled,
                    error: Error::Canceled.to_string(),
                })
                .await;
            TableOutcome::Canceled
        }
        Err(e) => {
            error!("{}: {}", table, e);
            if let Err(ledger_err) = ledger.record_error(dest, &table, &e.to_string()).await {
                warn!("{}: recording error to ledger failed: {}", table, ledger_err);
            }
            events
                .emit(SyncEvent::TableFailed {
                    table,
                    kind: e.kind(),
                    error: e.to_string(),
                })
                .await;
            TableOutcome::Failed
        }
    }
}

/// One table's pipeline: PK resolution, ledger bootstrap, strategy
/// selection, delta computation, transactional apply.
#[allow(clippy::too_many_arguments)]
async fn sync_table(
    source: &mut SqlServerClient,
    dest: &mut SqlServerClient,
    options: &SyncOptions,
    ledger: &Ledger,
    config: &TableSyncConfig,
    schema: &TableSchema,
    events: &EventSender,
    cancel: &CancelFlag,
) -> Result<SyncCounters> {
    cancel.check()?;

    let table = config.table.clone();
    let mut state = TableState::SchemaReady;
    events
        .emit(SyncEvent::TableStarted {
            table: table.clone(),
        })
        .await;

    let (pk, pk_auto_detected) = resolve_primary_key(schema, config)?;
    let filter = config.row_filter.as_deref();
    debug!(
        "{}: state {:?}, effective pk {:?} (auto={})",
        table, state, pk, pk_auto_detected
    );

    let entry = ledger.load(dest, &table).await?;
    let strategy = strategy::select(schema, entry.as_ref());

    ledger
        .initialize(
            dest,
            &table,
            &pk,
            pk_auto_detected,
            filter,
            strategy.ledger_label(),
            strategy.rowversion_column(),
        )
        .await?;
    ledger.record_start(dest, &table).await?;
    state = TableState::LedgerReady;

    events
        .emit(SyncEvent::TableStrategySelected {
            table: table.clone(),
            strategy: strategy.kind(),
        })
        .await;
    debug!("{}: strategy {}, state {:?}", table, strategy.kind(), state);

    cancel.check()?;
    let delta = DeltaComputer::compute(source, dest, schema, &pk, filter, &strategy).await?;

    state = TableState::Applying;
    debug!(
        "{}: applying {} candidate rows, state {:?}",
        table,
        delta.total(),
        state
    );
    let mut applier = BatchApplier::new(source, dest, options.batch_size, events, cancel);
    applier
        .apply(schema, &pk, filter, &delta, ledger, &strategy)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDesc, ColumnKind, KeyColumn, KeyDesc};

    fn column(name: &str, kind: ColumnKind) -> ColumnDesc {
        ColumnDesc {
            ordinal: 0,
            name: name.into(),
            type_name: "int".into(),
            max_length: 4,
            precision: 10,
            scale: 0,
            nullable: false,
            collation: None,
            is_rowguid: false,
            kind,
        }
    }

    fn schema_with_pk(pk: Option<&[&str]>) -> TableSchema {
        TableSchema {
            table: TableRef::new("dbo", "Customer"),
            columns: vec![
                column("Id", ColumnKind::Regular),
                column("Region", ColumnKind::Regular),
                column("Total", ColumnKind::Computed {
                    expression: "([Id] * 2)".into(),
                    persisted: false,
                }),
            ],
            primary_key: pk.map(|cols| KeyDesc {
                name: "PK_Customer".into(),
                clustered: true,
                columns: cols
                    .iter()
                    .map(|c| KeyColumn {
                        name: (*c).to_string(),
                        descending: false,
                    })
                    .collect(),
            }),
            unique_constraints: vec![],
            indexes: vec![],
            foreign_keys: vec![],
            check_constraints: vec![],
            default_constraints: vec![],
            triggers: vec![],
        }
    }

    #[test]
    fn test_resolve_pk_from_catalog() {
        let schema = schema_with_pk(Some(&["Id"]));
        let config = TableSyncConfig::new("dbo", "Customer");
        let (pk, auto) = resolve_primary_key(&schema, &config).unwrap();
        assert_eq!(pk, vec!["Id".to_string()]);
        assert!(auto);
    }

    #[test]
    fn test_resolve_pk_override_wins() {
        let schema = schema_with_pk(Some(&["Id"]));
        let config = TableSyncConfig::new("dbo", "Customer")
            .with_primary_key(vec!["Region".into(), "Id".into()]);
        let (pk, auto) = resolve_primary_key(&schema, &config).unwrap();
        assert_eq!(pk, vec!["Region".to_string(), "Id".to_string()]);
        assert!(!auto);
    }

    #[test]
    fn test_resolve_pk_override_canonicalizes_case() {
        let schema = schema_with_pk(None);
        let config =
            TableSyncConfig::new("dbo", "Customer").with_primary_key(vec!["id".into()]);
        let (pk, _) = resolve_primary_key(&schema, &config).unwrap();
        // Schema casing wins
        assert_eq!(pk, vec!["Id".to_string()]);
    }

    #[test]
    fn test_resolve_pk_no_key_errors() {
        let schema = schema_with_pk(None);
        let config = TableSyncConfig::new("dbo", "Customer");
        let err = resolve_primary_key(&schema, &config).unwrap_err();
        assert!(matches!(err, Error::NoPrimaryKey { .. }));
    }

    #[test]
    fn test_resolve_pk_override_missing_column() {
        let schema = schema_with_pk(Some(&["Id"]));
        let config =
            TableSyncConfig::new("dbo", "Customer").with_primary_key(vec!["Ghost".into()]);
        let err = resolve_primary_key(&schema, &config).unwrap_err();
        match err {
            Error::InvalidPkOverride { column, .. } => assert_eq!(column, "Ghost"),
            other => panic!("expected InvalidPkOverride, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_pk_override_rejects_computed_column() {
        let schema = schema_with_pk(Some(&["Id"]));
        let config =
            TableSyncConfig::new("dbo", "Customer").with_primary_key(vec!["Total".into()]);
        assert!(matches!(
            resolve_primary_key(&schema, &config),
            Err(Error::InvalidPkOverride { .. })
        ));
    }

    #[test]
    fn test_table_state_is_comparable() {
        assert_eq!(TableState::Pending, TableState::Pending);
        assert_ne!(TableState::Done, TableState::Failed);
    }
}
