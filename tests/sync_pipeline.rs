//! Cross-module pipeline tests.
//!
//! Exercise the schema model, DDL emission, dependency ordering, strategy
//! selection, and delta merging together, without a live server. The SQL
//! produced here is exactly what the orchestrator would execute.

use tablesync::catalog::{
    ColumnDesc, ColumnKind, ForeignKeyDesc, KeyColumn, KeyDesc, ReferentialAction, TableSchema,
};
use tablesync::ddl;
use tablesync::prelude::*;

fn column(ordinal: i32, name: &str, type_name: &str, kind: ColumnKind) -> ColumnDesc {
    ColumnDesc {
        ordinal,
        name: name.into(),
        type_name: type_name.into(),
        max_length: match type_name {
            "int" => 4,
            "nvarchar" => 200,
            "timestamp" => 8,
            _ => 8,
        },
        precision: 0,
        scale: 0,
        nullable: false,
        collation: None,
        is_rowguid: false,
        kind,
    }
}

/// `dbo.Customer(Id INT IDENTITY PK, Name NVARCHAR(100), RV ROWVERSION)`
fn customer() -> TableSchema {
    TableSchema {
        table: TableRef::new("dbo", "Customer"),
        columns: vec![
            column(1, "Id", "int", ColumnKind::Identity { seed: 1, increment: 1 }),
            column(2, "Name", "nvarchar", ColumnKind::Regular),
            column(3, "RV", "timestamp", ColumnKind::RowVersion),
        ],
        primary_key: Some(KeyDesc {
            name: "PK_Customer".into(),
            clustered: true,
            columns: vec![KeyColumn {
                name: "Id".into(),
                descending: false,
            }],
        }),
        unique_constraints: vec![],
        indexes: vec![],
        foreign_keys: vec![],
        check_constraints: vec![],
        default_constraints: vec![],
        triggers: vec![],
    }
}

/// `dbo.Order(Id INT PK, CustomerId INT FK -> Customer)`
fn order() -> TableSchema {
    TableSchema {
        table: TableRef::new("dbo", "Order"),
        columns: vec![
            column(1, "Id", "int", ColumnKind::Regular),
            column(2, "CustomerId", "int", ColumnKind::Regular),
        ],
        primary_key: Some(KeyDesc {
            name: "PK_Order".into(),
            clustered: true,
            columns: vec![KeyColumn {
                name: "Id".into(),
                descending: false,
            }],
        }),
        unique_constraints: vec![],
        indexes: vec![],
        foreign_keys: vec![ForeignKeyDesc {
            name: "FK_Order_Customer".into(),
            columns: vec![("CustomerId".into(), "Id".into())],
            referenced_table: TableRef::new("dbo", "Customer"),
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
            disabled: false,
        }],
        check_constraints: vec![],
        default_constraints: vec![],
        triggers: vec![],
    }
}

#[test]
fn fresh_mirror_schema_and_strategy() {
    let schema = customer();
    schema.validate().unwrap();

    // Mirror DDL carries identity and rowversion through
    let stmts = ddl::table_statements(&schema);
    assert!(stmts[0].contains("[Id] INT IDENTITY(1,1) NOT NULL"));
    assert!(stmts[0].contains("[RV] ROWVERSION NOT NULL"));
    assert!(stmts
        .iter()
        .any(|s| s.contains("PRIMARY KEY CLUSTERED ([Id] ASC)")));

    // No ledger entry yet: first run is rowversion-initial from the zero
    // stamp, which processes every row
    let strategy = tablesync::strategy::select(&schema, None);
    assert_eq!(strategy.kind(), StrategyKind::RowVersionInitial);
    match strategy {
        ChangeStrategy::RowVersion {
            column, high_water, ..
        } => {
            assert_eq!(column, "RV");
            assert_eq!(high_water, RowVersion::ZERO);
        }
        other => panic!("expected rowversion strategy, got {:?}", other),
    }
}

#[test]
fn rowversion_table_without_rowversion_falls_back_to_hash() {
    let mut schema = customer();
    schema.columns.retain(|c| c.kind != ColumnKind::RowVersion);
    let strategy = tablesync::strategy::select(&schema, None);
    assert_eq!(strategy.kind(), StrategyKind::Hash);
}

#[test]
fn fk_ordering_referenced_table_first() {
    let schemas = vec![order(), customer()];
    let statements = ddl::mirror_statements(&schemas);

    let customer_pos = statements
        .iter()
        .position(|s| s.starts_with("CREATE TABLE [dbo].[Customer]"))
        .unwrap();
    let order_pos = statements
        .iter()
        .position(|s| s.starts_with("CREATE TABLE [dbo].[Order]"))
        .unwrap();
    let fk_pos = statements
        .iter()
        .position(|s| s.contains("FOREIGN KEY"))
        .unwrap();

    assert!(customer_pos < order_pos, "referenced table created first");
    assert!(fk_pos > order_pos, "foreign keys trail all creates");
}

#[test]
fn mutual_references_still_produce_complete_ddl() {
    let mut a = customer();
    a.table = TableRef::new("dbo", "A");
    a.foreign_keys.push(ForeignKeyDesc {
        name: "FK_A_B".into(),
        columns: vec![("Id".into(), "Id".into())],
        referenced_table: TableRef::new("dbo", "B"),
        on_delete: ReferentialAction::NoAction,
        on_update: ReferentialAction::NoAction,
        disabled: false,
    });
    let mut b = customer();
    b.table = TableRef::new("dbo", "B");
    b.foreign_keys.push(ForeignKeyDesc {
        name: "FK_B_A".into(),
        columns: vec![("Id".into(), "Id".into())],
        referenced_table: TableRef::new("dbo", "A"),
        on_delete: ReferentialAction::NoAction,
        on_update: ReferentialAction::NoAction,
        disabled: false,
    });

    let statements = ddl::mirror_statements(&[a, b]);
    let creates = statements
        .iter()
        .filter(|s| s.starts_with("CREATE TABLE"))
        .count();
    let fks = statements
        .iter()
        .filter(|s| s.contains("FOREIGN KEY"))
        .count();
    assert_eq!(creates, 2);
    assert_eq!(fks, 2);

    // Every FK statement appears after every CREATE TABLE
    let last_create = statements
        .iter()
        .rposition(|s| s.starts_with("CREATE TABLE"))
        .unwrap();
    let first_fk = statements
        .iter()
        .position(|s| s.contains("FOREIGN KEY"))
        .unwrap();
    assert!(first_fk > last_create);
}

#[test]
fn pk_override_flows_into_scan_sql() {
    let mut schema = customer();
    schema.primary_key = None;

    let config = TableSyncConfig::new("dbo", "Customer").with_primary_key(vec!["Name".into()]);
    let (pk, auto) = tablesync::orchestrator::resolve_primary_key(&schema, &config).unwrap();
    assert_eq!(pk, vec!["Name".to_string()]);
    assert!(!auto);

    // Without the override the table is unsyncable
    let bare = TableSyncConfig::new("dbo", "Customer");
    assert!(matches!(
        tablesync::orchestrator::resolve_primary_key(&schema, &bare),
        Err(Error::NoPrimaryKey { .. })
    ));
}

#[test]
fn run_summary_accounting() {
    let mut summary = RunSummary {
        tables_total: 2,
        ..RunSummary::default()
    };
    summary.tables_ok += 1;
    summary.tables_failed += 1;
    assert!(!summary.is_complete());
    assert_eq!(summary.tables_total, 2);
}

#[test]
fn counters_accumulate_per_kind() {
    let counters = SyncCounters {
        inserted: 3,
        updated: 1,
        deleted: 2,
    };
    assert_eq!(counters.total(), 6);
}

#[test]
fn ledger_strategy_graduates_after_initial_run() {
    let schema = customer();
    let strategy = tablesync::strategy::select(&schema, None);

    // Recorded as INITIAL while running, ROWVERSION once successful
    assert_eq!(strategy.ledger_label(), LedgerStrategy::Initial);
    assert_eq!(strategy.success_label(), LedgerStrategy::RowVersion);
}
