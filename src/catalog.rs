//! System catalog reader and structural table model.
//!
//! [`CatalogReader`] queries the `sys.*` catalog views of a live connection
//! and produces a [`TableSchema`]: the complete structural description of one
//! table (columns with exact types, keys, indexes, foreign keys, constraints,
//! triggers). The description is the single input to DDL emission
//! ([`crate::ddl`]) and drives which columns the delta engine reads and
//! writes.
//!
//! Column semantics are a tagged variant ([`ColumnKind`]) so rendering and
//! write-set decisions are exhaustive case analysis instead of flag checks.

use crate::client::SqlServerClient;
use crate::error::Error;
use crate::types::{Row, TableRef, Value};
use crate::Result;
use tracing::debug;

/// What kind of column this is, beyond its declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    /// Plain data column
    Regular,
    /// `IDENTITY(seed, increment)` column
    Identity {
        /// Seed value
        seed: i64,
        /// Increment value
        increment: i64,
    },
    /// Computed column; never written, type comes from the expression
    Computed {
        /// Defining expression as stored by the catalog
        expression: String,
        /// Whether the value is persisted
        persisted: bool,
    },
    /// Server-maintained 8-byte version stamp; never written
    RowVersion,
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDesc {
    /// 1-based ordinal in the table
    pub ordinal: i32,
    /// Column name
    pub name: String,
    /// Base type name as stored by the catalog (lowercase, e.g. `nvarchar`)
    pub type_name: String,
    /// Max length in bytes; `-1` for MAX types
    pub max_length: i16,
    /// Numeric precision
    pub precision: u8,
    /// Numeric/temporal scale
    pub scale: u8,
    /// NULL / NOT NULL
    pub nullable: bool,
    /// Collation, for character types only
    pub collation: Option<String>,
    /// `ROWGUIDCOL` marker
    pub is_rowguid: bool,
    /// Column kind (regular / identity / computed / rowversion)
    pub kind: ColumnKind,
}

impl ColumnDesc {
    /// Whether the batch applier may write this column.
    ///
    /// Computed and rowversion columns are regenerated by the destination
    /// server; identity columns are written under `IDENTITY_INSERT`.
    pub fn is_writable(&self) -> bool {
        !matches!(
            self.kind,
            ColumnKind::Computed { .. } | ColumnKind::RowVersion
        )
    }
}

/// One key column with its sort direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    /// Column name
    pub name: String,
    /// DESC when true
    pub descending: bool,
}

/// Primary-key constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDesc {
    /// Constraint name
    pub name: String,
    /// Whether the backing index is clustered
    pub clustered: bool,
    /// Key columns in key-ordinal order
    pub columns: Vec<KeyColumn>,
}

impl KeyDesc {
    /// Key column names in order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// UNIQUE constraint (distinct from a plain unique index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraintDesc {
    /// Constraint name
    pub name: String,
    /// Columns in key-ordinal order
    pub columns: Vec<String>,
}

/// Secondary index (PK- and unique-constraint-backing indexes excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDesc {
    /// Index name
    pub name: String,
    /// CLUSTERED vs NONCLUSTERED
    pub clustered: bool,
    /// UNIQUE flag
    pub unique: bool,
    /// Key columns with directions
    pub key_columns: Vec<KeyColumn>,
    /// INCLUDE (non-key) columns
    pub included_columns: Vec<String>,
    /// Filter predicate for filtered indexes
    pub filter: Option<String>,
    /// Fill factor; 0 means server default
    pub fill_factor: u8,
}

/// Referential action on a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentialAction {
    /// NO ACTION (default)
    #[default]
    NoAction,
    /// CASCADE
    Cascade,
    /// SET NULL
    SetNull,
    /// SET DEFAULT
    SetDefault,
}

impl ReferentialAction {
    /// Parse the catalog's `*_referential_action_desc` value.
    pub fn from_catalog(desc: &str) -> Self {
        match desc {
            "CASCADE" => Self::Cascade,
            "SET_NULL" => Self::SetNull,
            "SET_DEFAULT" => Self::SetDefault,
            _ => Self::NoAction,
        }
    }

    /// SQL text of the action.
    pub const fn to_sql(self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

/// Foreign-key constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDesc {
    /// Constraint name
    pub name: String,
    /// `(local, referenced)` column pairs in constraint-column order
    pub columns: Vec<(String, String)>,
    /// The referenced table
    pub referenced_table: TableRef,
    /// ON DELETE action
    pub on_delete: ReferentialAction,
    /// ON UPDATE action
    pub on_update: ReferentialAction,
    /// Whether the constraint is disabled (`NOCHECK`)
    pub disabled: bool,
}

/// CHECK constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConstraintDesc {
    /// Constraint name
    pub name: String,
    /// Expression text as stored by the catalog (parenthesized)
    pub expression: String,
    /// Whether the constraint is disabled
    pub disabled: bool,
}

/// Named DEFAULT constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultConstraintDesc {
    /// Constraint name
    pub name: String,
    /// Column the default applies to
    pub column: String,
    /// Default expression as stored by the catalog
    pub expression: String,
}

/// Trigger timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    /// AFTER trigger
    After,
    /// INSTEAD OF trigger
    InsteadOf,
}

/// DML event a trigger fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    /// INSERT
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
}

/// Trigger on a table. The body is the complete `CREATE TRIGGER` text.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerDesc {
    /// Trigger name
    pub name: String,
    /// AFTER vs INSTEAD OF
    pub timing: TriggerTiming,
    /// DML events the trigger fires on
    pub events: Vec<TriggerEvent>,
    /// Full `CREATE TRIGGER` definition
    pub body: String,
    /// Whether the trigger is disabled
    pub disabled: bool,
}

/// Complete structural description of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    /// The table's identity
    pub table: TableRef,
    /// Columns in ordinal order
    pub columns: Vec<ColumnDesc>,
    /// Primary key, if any
    pub primary_key: Option<KeyDesc>,
    /// UNIQUE constraints
    pub unique_constraints: Vec<UniqueConstraintDesc>,
    /// Secondary indexes
    pub indexes: Vec<IndexDesc>,
    /// Foreign keys
    pub foreign_keys: Vec<ForeignKeyDesc>,
    /// CHECK constraints
    pub check_constraints: Vec<CheckConstraintDesc>,
    /// Named DEFAULT constraints
    pub default_constraints: Vec<DefaultConstraintDesc>,
    /// Triggers
    pub triggers: Vec<TriggerDesc>,
}

impl TableSchema {
    /// Look up a column by name (case-insensitive).
    pub fn column(&self, name: &str) -> Option<&ColumnDesc> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// The table's rowversion column, if it has one (at most one can exist).
    pub fn rowversion_column(&self) -> Option<&ColumnDesc> {
        self.columns
            .iter()
            .find(|c| c.kind == ColumnKind::RowVersion)
    }

    /// The table's identity column, if any.
    pub fn identity_column(&self) -> Option<&ColumnDesc> {
        self.columns
            .iter()
            .find(|c| matches!(c.kind, ColumnKind::Identity { .. }))
    }

    /// Columns the delta engine reads and the applier writes: everything
    /// except computed and rowversion columns.
    pub fn data_columns(&self) -> Vec<&ColumnDesc> {
        self.columns.iter().filter(|c| c.is_writable()).collect()
    }

    /// Names of the data columns, in ordinal order.
    pub fn data_column_names(&self) -> Vec<String> {
        self.data_columns().iter().map(|c| c.name.clone()).collect()
    }

    /// Tables this table references through its foreign keys.
    pub fn referenced_tables(&self) -> Vec<&TableRef> {
        self.foreign_keys
            .iter()
            .map(|fk| &fk.referenced_table)
            .collect()
    }

    /// Check the structural invariant: every column referenced by a key,
    /// index, foreign key, or default exists in the column list.
    pub fn validate(&self) -> Result<()> {
        let check = |name: &str, what: &str| -> Result<()> {
            if self.column(name).is_none() {
                return Err(Error::catalog(
                    self.table.to_string(),
                    format!("{} references unknown column '{}'", what, name),
                ));
            }
            Ok(())
        };

        if let Some(pk) = &self.primary_key {
            for col in &pk.columns {
                check(&col.name, "primary key")?;
            }
        }
        for uq in &self.unique_constraints {
            for col in &uq.columns {
                check(col, "unique constraint")?;
            }
        }
        for idx in &self.indexes {
            for col in &idx.key_columns {
                check(&col.name, "index")?;
            }
            for col in &idx.included_columns {
                check(col, "index include list")?;
            }
        }
        for fk in &self.foreign_keys {
            for (local, _) in &fk.columns {
                check(local, "foreign key")?;
            }
        }
        for df in &self.default_constraints {
            check(&df.column, "default constraint")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reads [`TableSchema`] descriptions from a live connection's system catalog.
pub struct CatalogReader;

impl CatalogReader {
    /// Check whether a table exists.
    pub async fn table_exists(client: &mut SqlServerClient, table: &TableRef) -> Result<bool> {
        let rows = client
            .query(
                "SELECT 1 FROM sys.tables t \
                 INNER JOIN sys.schemas s ON t.schema_id = s.schema_id \
                 WHERE s.name = @P1 AND t.name = @P2",
                &[
                    Value::String(table.schema.clone()),
                    Value::String(table.name.clone()),
                ],
            )
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;
        Ok(!rows.is_empty())
    }

    /// Read the complete structural description of a table.
    pub async fn read(client: &mut SqlServerClient, table: &TableRef) -> Result<TableSchema> {
        let object_id = Self::object_id(client, table)
            .await?
            .ok_or_else(|| Error::TableNotFound {
                table: table.to_string(),
            })?;

        let columns = Self::read_columns(client, table, object_id).await?;
        let primary_key = Self::read_primary_key(client, table, object_id).await?;
        let unique_constraints = Self::read_unique_constraints(client, table, object_id).await?;
        let indexes = Self::read_indexes(client, table, object_id).await?;
        let foreign_keys = Self::read_foreign_keys(client, table, object_id).await?;
        let check_constraints = Self::read_check_constraints(client, table, object_id).await?;
        let default_constraints = Self::read_default_constraints(client, table, object_id).await?;
        let triggers = Self::read_triggers(client, table, object_id).await?;

        let schema = TableSchema {
            table: table.clone(),
            columns,
            primary_key,
            unique_constraints,
            indexes,
            foreign_keys,
            check_constraints,
            default_constraints,
            triggers,
        };
        schema.validate()?;

        debug!(
            "read schema for {}: {} columns, pk={}, {} indexes, {} fks",
            table,
            schema.columns.len(),
            schema.primary_key.is_some(),
            schema.indexes.len(),
            schema.foreign_keys.len()
        );
        Ok(schema)
    }

    async fn object_id(client: &mut SqlServerClient, table: &TableRef) -> Result<Option<i32>> {
        let row = client
            .query_one(
                "SELECT t.object_id FROM sys.tables t \
                 INNER JOIN sys.schemas s ON t.schema_id = s.schema_id \
                 WHERE s.name = @P1 AND t.name = @P2",
                &[
                    Value::String(table.schema.clone()),
                    Value::String(table.name.clone()),
                ],
            )
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;
        Ok(row.and_then(|r| r.get(0).and_then(|v| v.as_i64()).map(|v| v as i32)))
    }

    async fn read_columns(
        client: &mut SqlServerClient,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Vec<ColumnDesc>> {
        let sql = "SELECT \
                c.column_id, \
                c.name, \
                t.name AS type_name, \
                c.max_length, \
                c.precision, \
                c.scale, \
                c.is_nullable, \
                c.is_identity, \
                c.is_computed, \
                c.is_rowguidcol, \
                c.collation_name, \
                CAST(ISNULL(ic.seed_value, 0) AS BIGINT) AS identity_seed, \
                CAST(ISNULL(ic.increment_value, 0) AS BIGINT) AS identity_increment, \
                cc.definition AS computed_definition, \
                ISNULL(cc.is_persisted, 0) AS computed_is_persisted \
            FROM sys.columns c \
            INNER JOIN sys.types t ON c.user_type_id = t.user_type_id \
            LEFT JOIN sys.identity_columns ic \
                ON c.object_id = ic.object_id AND c.column_id = ic.column_id \
            LEFT JOIN sys.computed_columns cc \
                ON c.object_id = cc.object_id AND c.column_id = cc.column_id \
            WHERE c.object_id = @P1 \
            ORDER BY c.column_id";

        let rows = client
            .query(sql, &[Value::Int32(object_id)])
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let type_name = get_string(&row, "type_name", table)?;
            let is_identity = get_bool(&row, "is_identity", table)?;
            let is_computed = get_bool(&row, "is_computed", table)?;
            let is_rowversion = matches!(type_name.as_str(), "timestamp" | "rowversion");

            let kind = if is_computed {
                ColumnKind::Computed {
                    expression: get_string(&row, "computed_definition", table)?,
                    persisted: get_bool(&row, "computed_is_persisted", table)?,
                }
            } else if is_rowversion {
                ColumnKind::RowVersion
            } else if is_identity {
                ColumnKind::Identity {
                    seed: get_i64(&row, "identity_seed", table)?,
                    increment: get_i64(&row, "identity_increment", table)?,
                }
            } else {
                ColumnKind::Regular
            };

            columns.push(ColumnDesc {
                ordinal: get_i64(&row, "column_id", table)? as i32,
                name: get_string(&row, "name", table)?,
                type_name,
                max_length: get_i64(&row, "max_length", table)? as i16,
                precision: get_i64(&row, "precision", table)? as u8,
                scale: get_i64(&row, "scale", table)? as u8,
                nullable: get_bool(&row, "is_nullable", table)?,
                collation: get_opt_string(&row, "collation_name"),
                is_rowguid: get_bool(&row, "is_rowguidcol", table)?,
                kind,
            });
        }
        Ok(columns)
    }

    async fn read_primary_key(
        client: &mut SqlServerClient,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Option<KeyDesc>> {
        let sql = "SELECT \
                kc.name AS constraint_name, \
                i.type_desc AS index_type, \
                c.name AS column_name, \
                ic.is_descending_key \
            FROM sys.key_constraints kc \
            INNER JOIN sys.indexes i \
                ON kc.parent_object_id = i.object_id AND kc.unique_index_id = i.index_id \
            INNER JOIN sys.index_columns ic \
                ON i.object_id = ic.object_id AND i.index_id = ic.index_id \
            INNER JOIN sys.columns c \
                ON ic.object_id = c.object_id AND ic.column_id = c.column_id \
            WHERE kc.parent_object_id = @P1 AND kc.type = 'PK' \
            ORDER BY ic.key_ordinal";

        let rows = client
            .query(sql, &[Value::Int32(object_id)])
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let name = get_string(&rows[0], "constraint_name", table)?;
        let clustered = get_string(&rows[0], "index_type", table)? == "CLUSTERED";
        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            columns.push(KeyColumn {
                name: get_string(row, "column_name", table)?,
                descending: get_bool(row, "is_descending_key", table)?,
            });
        }

        Ok(Some(KeyDesc {
            name,
            clustered,
            columns,
        }))
    }

    async fn read_unique_constraints(
        client: &mut SqlServerClient,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Vec<UniqueConstraintDesc>> {
        let sql = "SELECT \
                kc.name AS constraint_name, \
                c.name AS column_name \
            FROM sys.key_constraints kc \
            INNER JOIN sys.indexes i \
                ON kc.parent_object_id = i.object_id AND kc.unique_index_id = i.index_id \
            INNER JOIN sys.index_columns ic \
                ON i.object_id = ic.object_id AND i.index_id = ic.index_id \
            INNER JOIN sys.columns c \
                ON ic.object_id = c.object_id AND ic.column_id = c.column_id \
            WHERE kc.parent_object_id = @P1 AND kc.type = 'UQ' \
            ORDER BY kc.name, ic.key_ordinal";

        let rows = client
            .query(sql, &[Value::Int32(object_id)])
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;

        let mut constraints: Vec<UniqueConstraintDesc> = Vec::new();
        for row in &rows {
            let name = get_string(row, "constraint_name", table)?;
            let column = get_string(row, "column_name", table)?;
            let start_new = constraints.last().map(|c| c.name != name).unwrap_or(true);
            if start_new {
                constraints.push(UniqueConstraintDesc {
                    name,
                    columns: Vec::new(),
                });
            }
            if let Some(last) = constraints.last_mut() {
                last.columns.push(column);
            }
        }
        Ok(constraints)
    }

    async fn read_indexes(
        client: &mut SqlServerClient,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Vec<IndexDesc>> {
        // PK- and UQ-backing indexes are emitted as constraints, not indexes;
        // type > 0 excludes the heap pseudo-index.
        let sql = "SELECT \
                i.index_id, \
                i.name AS index_name, \
                i.type_desc, \
                i.is_unique, \
                i.fill_factor, \
                i.filter_definition, \
                ic.is_included_column, \
                ic.is_descending_key, \
                c.name AS column_name \
            FROM sys.indexes i \
            INNER JOIN sys.index_columns ic \
                ON i.object_id = ic.object_id AND i.index_id = ic.index_id \
            INNER JOIN sys.columns c \
                ON ic.object_id = c.object_id AND ic.column_id = c.column_id \
            WHERE i.object_id = @P1 \
                AND i.is_primary_key = 0 \
                AND i.is_unique_constraint = 0 \
                AND i.type > 0 \
            ORDER BY i.index_id, ic.is_included_column, ic.key_ordinal";

        let rows = client
            .query(sql, &[Value::Int32(object_id)])
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;

        let mut indexes: Vec<(i64, IndexDesc)> = Vec::new();
        for row in &rows {
            let index_id = get_i64(row, "index_id", table)?;
            let column = get_string(row, "column_name", table)?;
            let included = get_bool(row, "is_included_column", table)?;
            let descending = get_bool(row, "is_descending_key", table)?;

            let start_new = indexes.last().map(|(id, _)| *id != index_id).unwrap_or(true);
            if start_new {
                indexes.push((
                    index_id,
                    IndexDesc {
                        name: get_string(row, "index_name", table)?,
                        clustered: get_string(row, "type_desc", table)? == "CLUSTERED",
                        unique: get_bool(row, "is_unique", table)?,
                        key_columns: Vec::new(),
                        included_columns: Vec::new(),
                        filter: get_opt_string(row, "filter_definition"),
                        fill_factor: get_i64(row, "fill_factor", table)? as u8,
                    },
                ));
            }
            if let Some((_, entry)) = indexes.last_mut() {
                if included {
                    entry.included_columns.push(column);
                } else {
                    entry.key_columns.push(KeyColumn {
                        name: column,
                        descending,
                    });
                }
            }
        }

        Ok(indexes.into_iter().map(|(_, idx)| idx).collect())
    }

    async fn read_foreign_keys(
        client: &mut SqlServerClient,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Vec<ForeignKeyDesc>> {
        let sql = "SELECT \
                fk.name AS fk_name, \
                fk.delete_referential_action_desc, \
                fk.update_referential_action_desc, \
                fk.is_disabled, \
                SCHEMA_NAME(ref_t.schema_id) AS referenced_schema, \
                ref_t.name AS referenced_table, \
                parent_col.name AS parent_column, \
                ref_col.name AS referenced_column \
            FROM sys.foreign_keys fk \
            INNER JOIN sys.foreign_key_columns fkc \
                ON fk.object_id = fkc.constraint_object_id \
            INNER JOIN sys.columns parent_col \
                ON fkc.parent_object_id = parent_col.object_id \
                AND fkc.parent_column_id = parent_col.column_id \
            INNER JOIN sys.columns ref_col \
                ON fkc.referenced_object_id = ref_col.object_id \
                AND fkc.referenced_column_id = ref_col.column_id \
            INNER JOIN sys.tables ref_t ON fkc.referenced_object_id = ref_t.object_id \
            WHERE fk.parent_object_id = @P1 \
            ORDER BY fk.name, fkc.constraint_column_id";

        let rows = client
            .query(sql, &[Value::Int32(object_id)])
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;

        let mut fks: Vec<ForeignKeyDesc> = Vec::new();
        for row in &rows {
            let name = get_string(row, "fk_name", table)?;
            let pair = (
                get_string(row, "parent_column", table)?,
                get_string(row, "referenced_column", table)?,
            );
            let start_new = fks.last().map(|f| f.name != name).unwrap_or(true);
            if start_new {
                fks.push(ForeignKeyDesc {
                    name,
                    columns: Vec::new(),
                    referenced_table: TableRef::new(
                        get_string(row, "referenced_schema", table)?,
                        get_string(row, "referenced_table", table)?,
                    ),
                    on_delete: ReferentialAction::from_catalog(&get_string(
                        row,
                        "delete_referential_action_desc",
                        table,
                    )?),
                    on_update: ReferentialAction::from_catalog(&get_string(
                        row,
                        "update_referential_action_desc",
                        table,
                    )?),
                    disabled: get_bool(row, "is_disabled", table)?,
                });
            }
            if let Some(last) = fks.last_mut() {
                last.columns.push(pair);
            }
        }
        Ok(fks)
    }

    async fn read_check_constraints(
        client: &mut SqlServerClient,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Vec<CheckConstraintDesc>> {
        let sql = "SELECT cc.name, cc.definition, cc.is_disabled \
            FROM sys.check_constraints cc \
            WHERE cc.parent_object_id = @P1 \
            ORDER BY cc.name";

        let rows = client
            .query(sql, &[Value::Int32(object_id)])
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;

        rows.iter()
            .map(|row| {
                Ok(CheckConstraintDesc {
                    name: get_string(row, "name", table)?,
                    expression: get_string(row, "definition", table)?,
                    disabled: get_bool(row, "is_disabled", table)?,
                })
            })
            .collect()
    }

    async fn read_default_constraints(
        client: &mut SqlServerClient,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Vec<DefaultConstraintDesc>> {
        let sql = "SELECT dc.name, c.name AS column_name, dc.definition \
            FROM sys.default_constraints dc \
            INNER JOIN sys.columns c \
                ON dc.parent_object_id = c.object_id AND dc.parent_column_id = c.column_id \
            WHERE dc.parent_object_id = @P1 \
            ORDER BY c.column_id";

        let rows = client
            .query(sql, &[Value::Int32(object_id)])
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;

        rows.iter()
            .map(|row| {
                Ok(DefaultConstraintDesc {
                    name: get_string(row, "name", table)?,
                    column: get_string(row, "column_name", table)?,
                    expression: get_string(row, "definition", table)?,
                })
            })
            .collect()
    }

    async fn read_triggers(
        client: &mut SqlServerClient,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Vec<TriggerDesc>> {
        let sql = "SELECT \
                tr.object_id, \
                tr.name, \
                tr.is_disabled, \
                tr.is_instead_of_trigger, \
                OBJECT_DEFINITION(tr.object_id) AS definition \
            FROM sys.triggers tr \
            WHERE tr.parent_id = @P1 \
            ORDER BY tr.name";

        let rows = client
            .query(sql, &[Value::Int32(object_id)])
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;

        let mut triggers = Vec::with_capacity(rows.len());
        for row in &rows {
            let trigger_id = get_i64(row, "object_id", table)? as i32;
            let events = Self::read_trigger_events(client, table, trigger_id).await?;
            triggers.push(TriggerDesc {
                name: get_string(row, "name", table)?,
                timing: if get_bool(row, "is_instead_of_trigger", table)? {
                    TriggerTiming::InsteadOf
                } else {
                    TriggerTiming::After
                },
                events,
                body: get_string(row, "definition", table)?,
                disabled: get_bool(row, "is_disabled", table)?,
            });
        }
        Ok(triggers)
    }

    async fn read_trigger_events(
        client: &mut SqlServerClient,
        table: &TableRef,
        trigger_id: i32,
    ) -> Result<Vec<TriggerEvent>> {
        let rows = client
            .query(
                "SELECT te.type_desc FROM sys.trigger_events te \
                 WHERE te.object_id = @P1 ORDER BY te.type",
                &[Value::Int32(trigger_id)],
            )
            .await
            .map_err(|e| Error::catalog(table.to_string(), e.to_string()))?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                match row.get(0).and_then(|v| v.as_str()) {
                    Some("INSERT") => Some(TriggerEvent::Insert),
                    Some("UPDATE") => Some(TriggerEvent::Update),
                    Some("DELETE") => Some(TriggerEvent::Delete),
                    _ => None,
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Row extraction helpers
// ---------------------------------------------------------------------------

fn get_string(row: &Row, name: &str, table: &TableRef) -> Result<String> {
    match row.get_by_name(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        other => Err(Error::catalog(
            table.to_string(),
            format!("column '{}' missing or not a string: {:?}", name, other),
        )),
    }
}

fn get_opt_string(row: &Row, name: &str) -> Option<String> {
    match row.get_by_name(name) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn get_bool(row: &Row, name: &str, table: &TableRef) -> Result<bool> {
    row.get_by_name(name)
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            Error::catalog(
                table.to_string(),
                format!("column '{}' missing or not a bool", name),
            )
        })
}

fn get_i64(row: &Row, name: &str, table: &TableRef) -> Result<i64> {
    row.get_by_name(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            Error::catalog(
                table.to_string(),
                format!("column '{}' missing or not an integer", name),
            )
        })
}
