//! DDL emission and cross-table dependency ordering.
//!
//! Renders a [`TableSchema`] into the ordered statement sequence that
//! recreates the same structure on the destination. Per-table order:
//! `CREATE TABLE`, primary key, unique constraints, secondary indexes,
//! check constraints, default constraints, then triggers last (trigger
//! bodies may reference objects created earlier in the batch).
//!
//! Foreign keys are always emitted separately, after every table's base
//! structure exists. This makes creation order-proof against reference
//! cycles: the FK graph never has to be strictly topologically sorted,
//! it only orders the `CREATE TABLE` statements for determinism.

use crate::catalog::{ColumnDesc, ColumnKind, ReferentialAction, TableSchema};
use crate::security::quote_identifier;
use crate::types::TableRef;

/// Render the declared type exactly as the catalog describes it.
///
/// `max_length` is bytes; N-types render half of it. `-1` renders `MAX`.
pub fn column_type_spec(col: &ColumnDesc) -> String {
    let upper = col.type_name.to_uppercase();
    match col.type_name.as_str() {
        "char" | "varchar" | "nchar" | "nvarchar" | "binary" | "varbinary" => {
            if col.max_length == -1 {
                format!("{}(MAX)", upper)
            } else {
                let length = if col.type_name.starts_with('n') {
                    col.max_length / 2
                } else {
                    col.max_length
                };
                format!("{}({})", upper, length)
            }
        }
        "decimal" | "numeric" => format!("{}({},{})", upper, col.precision, col.scale),
        "time" | "datetime2" | "datetimeoffset" => format!("{}({})", upper, col.scale),
        "timestamp" | "rowversion" => "ROWVERSION".to_string(),
        _ => upper,
    }
}

/// Render one column definition for the CREATE TABLE body.
fn column_definition(col: &ColumnDesc) -> String {
    match &col.kind {
        ColumnKind::Computed {
            expression,
            persisted,
        } => {
            // Computed columns take no type; the catalog expression is
            // already parenthesized.
            let mut def = format!("{} AS {}", quote_identifier(&col.name), expression);
            if *persisted {
                def.push_str(" PERSISTED");
            }
            def
        }
        ColumnKind::RowVersion => {
            let nullability = if col.nullable { "NULL" } else { "NOT NULL" };
            format!("{} ROWVERSION {}", quote_identifier(&col.name), nullability)
        }
        kind => {
            let mut def = format!(
                "{} {}",
                quote_identifier(&col.name),
                column_type_spec(col)
            );
            if let Some(collation) = &col.collation {
                def.push_str(&format!(" COLLATE {}", collation));
            }
            if let ColumnKind::Identity { seed, increment } = kind {
                def.push_str(&format!(" IDENTITY({},{})", seed, increment));
            }
            if col.is_rowguid {
                def.push_str(" ROWGUIDCOL");
            }
            def.push_str(if col.nullable { " NULL" } else { " NOT NULL" });
            def
        }
    }
}

/// Render the `CREATE TABLE` statement (columns only; constraints follow).
fn create_table_statement(schema: &TableSchema) -> String {
    let column_defs: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("    {}", column_definition(c)))
        .collect();
    format!(
        "CREATE TABLE {} (\n{}\n)",
        schema.table.qualified(),
        column_defs.join(",\n")
    )
}

fn key_column_list(columns: &[crate::catalog::KeyColumn]) -> String {
    columns
        .iter()
        .map(|c| {
            format!(
                "{} {}",
                quote_identifier(&c.name),
                if c.descending { "DESC" } else { "ASC" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Statements recreating one table's structure, foreign keys excluded.
pub fn table_statements(schema: &TableSchema) -> Vec<String> {
    let table = schema.table.qualified();
    let mut statements = vec![create_table_statement(schema)];

    if let Some(pk) = &schema.primary_key {
        statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY {} ({})",
            table,
            quote_identifier(&pk.name),
            if pk.clustered {
                "CLUSTERED"
            } else {
                "NONCLUSTERED"
            },
            key_column_list(&pk.columns)
        ));
    }

    for uq in &schema.unique_constraints {
        let cols = uq
            .columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            table,
            quote_identifier(&uq.name),
            cols
        ));
    }

    for idx in &schema.indexes {
        let mut stmt = format!(
            "CREATE {}{} INDEX {} ON {} ({})",
            if idx.unique { "UNIQUE " } else { "" },
            if idx.clustered {
                "CLUSTERED"
            } else {
                "NONCLUSTERED"
            },
            quote_identifier(&idx.name),
            table,
            key_column_list(&idx.key_columns)
        );
        if !idx.included_columns.is_empty() {
            let include = idx
                .included_columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");
            stmt.push_str(&format!(" INCLUDE ({})", include));
        }
        if let Some(filter) = &idx.filter {
            stmt.push_str(&format!(" WHERE {}", filter));
        }
        if idx.fill_factor > 0 {
            stmt.push_str(&format!(" WITH (FILLFACTOR = {})", idx.fill_factor));
        }
        statements.push(stmt);
    }

    for chk in &schema.check_constraints {
        statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} CHECK {}",
            table,
            quote_identifier(&chk.name),
            chk.expression
        ));
        if chk.disabled {
            statements.push(format!(
                "ALTER TABLE {} NOCHECK CONSTRAINT {}",
                table,
                quote_identifier(&chk.name)
            ));
        }
    }

    for df in &schema.default_constraints {
        statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} DEFAULT {} FOR {}",
            table,
            quote_identifier(&df.name),
            df.expression,
            quote_identifier(&df.column)
        ));
    }

    for trigger in &schema.triggers {
        statements.push(trigger.body.clone());
        if trigger.disabled {
            statements.push(format!(
                "DISABLE TRIGGER {}.{} ON {}",
                quote_identifier(&schema.table.schema),
                quote_identifier(&trigger.name),
                table
            ));
        }
    }

    statements
}

/// Foreign-key statements for one table, as trailing `ALTER TABLE`s.
pub fn foreign_key_statements(schema: &TableSchema) -> Vec<String> {
    let table = schema.table.qualified();
    let mut statements = Vec::new();

    for fk in &schema.foreign_keys {
        let local = fk
            .columns
            .iter()
            .map(|(l, _)| quote_identifier(l))
            .collect::<Vec<_>>()
            .join(", ");
        let referenced = fk
            .columns
            .iter()
            .map(|(_, r)| quote_identifier(r))
            .collect::<Vec<_>>()
            .join(", ");

        let mut stmt = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            table,
            quote_identifier(&fk.name),
            local,
            fk.referenced_table.qualified(),
            referenced
        );
        if fk.on_delete != ReferentialAction::NoAction {
            stmt.push_str(&format!(" ON DELETE {}", fk.on_delete.to_sql()));
        }
        if fk.on_update != ReferentialAction::NoAction {
            stmt.push_str(&format!(" ON UPDATE {}", fk.on_update.to_sql()));
        }
        statements.push(stmt);

        if fk.disabled {
            statements.push(format!(
                "ALTER TABLE {} NOCHECK CONSTRAINT {}",
                table,
                quote_identifier(&fk.name)
            ));
        }
    }

    statements
}

/// Statements recreating a set of tables: base structures in dependency
/// order, then every foreign key.
pub fn mirror_statements(schemas: &[TableSchema]) -> Vec<String> {
    let graph: Vec<(TableRef, Vec<TableRef>)> = schemas
        .iter()
        .map(|s| {
            (
                s.table.clone(),
                s.referenced_tables().into_iter().cloned().collect(),
            )
        })
        .collect();

    let mut ordered = Vec::new();
    for level in dependency_levels(&graph) {
        for table in level {
            if let Some(schema) = schemas.iter().find(|s| s.table == table) {
                ordered.extend(table_statements(schema));
            }
        }
    }
    for schema in schemas {
        ordered.extend(foreign_key_statements(schema));
    }
    ordered
}

/// Layer tables by foreign-key dependency: each level only references
/// tables in earlier levels (or outside the set).
///
/// Self-references and references to tables outside the set are ignored.
/// Tables forming reference cycles end up together in the final level;
/// since foreign keys are emitted after all creates, a cycle only affects
/// scheduling granularity, never correctness.
pub fn dependency_levels(tables: &[(TableRef, Vec<TableRef>)]) -> Vec<Vec<TableRef>> {
    use std::collections::HashSet;

    let in_set: HashSet<TableRef> = tables.iter().map(|(t, _)| t.clone()).collect();

    // Effective dependency lists: in-set, non-self references only
    let deps: Vec<(TableRef, Vec<TableRef>)> = tables
        .iter()
        .map(|(t, refs)| {
            let effective: Vec<TableRef> = refs
                .iter()
                .filter(|r| *r != t && in_set.contains(r))
                .cloned()
                .collect();
            (t.clone(), effective)
        })
        .collect();

    let mut placed: HashSet<TableRef> = HashSet::new();
    let mut levels: Vec<Vec<TableRef>> = Vec::new();

    while placed.len() < deps.len() {
        let mut level: Vec<TableRef> = Vec::new();
        for (table, effective) in &deps {
            if placed.contains(table) {
                continue;
            }
            if effective.iter().all(|r| placed.contains(r)) {
                level.push(table.clone());
            }
        }

        if level.is_empty() {
            // Cycle: every remaining table waits on another remaining table.
            // FKs are deferred past all creates, so lumping the cycle into
            // one final level is safe.
            level = deps
                .iter()
                .filter(|(t, _)| !placed.contains(t))
                .map(|(t, _)| t.clone())
                .collect();
            placed.extend(level.iter().cloned());
            levels.push(level);
            break;
        }

        placed.extend(level.iter().cloned());
        levels.push(level);
    }

    levels
}
