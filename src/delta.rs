//! Delta computation: which rows to INSERT, UPDATE, and DELETE.
//!
//! Streams `(key, stamp)` tuples from both databases in primary-key order
//! and merges them with two cursors. The stamp is the rowversion under the
//! rowversion strategy and a server-computed SHA2-256 row hash under the
//! hash strategy; either way only keys and fixed-size stamps cross the
//! wire during detection, never full rows.
//!
//! The row filter is applied to both sides of every scan with identical
//! text, so rows outside the filter are invisible to the delta; in
//! particular they are never deleted.

use crate::catalog::TableSchema;
use crate::client::SqlServerClient;
use crate::error::Error;
use crate::security::quote_identifier;
use crate::strategy::ChangeStrategy;
use crate::types::{Key, RowVersion, TableRef, Value};
use crate::Result;
use tracing::debug;

/// The three candidate sets for one table, keys in ascending PK order.
#[derive(Debug, Clone, Default)]
pub struct TableDelta {
    /// Keys present only at the source
    pub inserts: Vec<Key>,
    /// Keys present on both sides whose row changed
    pub updates: Vec<Key>,
    /// Keys present only at the destination
    pub deletes: Vec<Key>,
    /// Maximum source rowversion over the INSERT and UPDATE rows,
    /// captured before any write is applied. `None` under the hash
    /// strategy or when no candidate rows were observed.
    pub high_water: Option<RowVersion>,
}

impl TableDelta {
    /// Whether the destination is already converged.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Total candidate rows across the three sets.
    pub fn total(&self) -> u64 {
        (self.inserts.len() + self.updates.len() + self.deletes.len()) as u64
    }
}

// ---------------------------------------------------------------------------
// Scan SQL
// ---------------------------------------------------------------------------

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn order_by(pk: &[String]) -> String {
    pk.iter()
        .map(|c| format!("{} ASC", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn where_clause(filter: Option<&str>) -> String {
    match filter {
        Some(predicate) => format!(" WHERE ({})", predicate),
        None => String::new(),
    }
}

/// Scan of the PK columns only.
pub(crate) fn key_scan_sql(table: &TableRef, pk: &[String], filter: Option<&str>) -> String {
    format!(
        "SELECT {} FROM {}{} ORDER BY {}",
        quoted_list(pk),
        table.qualified(),
        where_clause(filter),
        order_by(pk)
    )
}

/// Scan of the PK columns plus the rowversion stamp.
pub(crate) fn rowversion_scan_sql(
    table: &TableRef,
    pk: &[String],
    rv_column: &str,
    filter: Option<&str>,
) -> String {
    format!(
        "SELECT {}, {} FROM {}{} ORDER BY {}",
        quoted_list(pk),
        quote_identifier(rv_column),
        table.qualified(),
        where_clause(filter),
        order_by(pk)
    )
}

/// Server-side row-hash expression over the data columns.
///
/// Every column is coalesced to the NCHAR(26) null sentinel before the
/// NCHAR(30)-separated concat, so NULL never collides with an empty string
/// and `(NULL, 'x')` never collides with `('x', NULL)`.
pub(crate) fn row_hash_expr(data_columns: &[String]) -> String {
    let rendered: Vec<String> = data_columns
        .iter()
        .map(|c| {
            format!(
                "COALESCE(CONVERT(NVARCHAR(MAX), {}), NCHAR(26))",
                quote_identifier(c)
            )
        })
        .collect();
    format!(
        "HASHBYTES('SHA2_256', CONCAT_WS(NCHAR(30), {}))",
        rendered.join(", ")
    )
}

/// Scan of the PK columns plus the row hash.
pub(crate) fn hash_scan_sql(
    table: &TableRef,
    pk: &[String],
    data_columns: &[String],
    filter: Option<&str>,
) -> String {
    format!(
        "SELECT {}, {} AS row_hash FROM {}{} ORDER BY {}",
        quoted_list(pk),
        row_hash_expr(data_columns),
        table.qualified(),
        where_clause(filter),
        order_by(pk)
    )
}

// ---------------------------------------------------------------------------
// Merges
// ---------------------------------------------------------------------------

/// Merge for the rowversion strategy.
///
/// Both inputs must be sorted ascending by key. Source rows carry their
/// rowversion; destination rows are keys only (the destination's own
/// rowversion values are local to that server and carry no information
/// about the source).
pub(crate) fn merge_rowversion(
    source: Vec<(Key, RowVersion)>,
    dest: Vec<Key>,
    high_water: RowVersion,
) -> TableDelta {
    let mut delta = TableDelta::default();
    let mut observed_max: Option<RowVersion> = None;
    let observe = |rv: RowVersion, max: &mut Option<RowVersion>| {
        *max = Some(match *max {
            Some(current) if current >= rv => current,
            _ => rv,
        });
    };

    let mut src = source.into_iter().peekable();
    let mut dst = dest.into_iter().peekable();

    loop {
        match (src.peek(), dst.peek()) {
            (Some((skey, _)), Some(dkey)) => match skey.cmp(dkey) {
                std::cmp::Ordering::Less => {
                    let (key, rv) = src.next().expect("peeked");
                    observe(rv, &mut observed_max);
                    delta.inserts.push(key);
                }
                std::cmp::Ordering::Greater => {
                    delta.deletes.push(dst.next().expect("peeked"));
                }
                std::cmp::Ordering::Equal => {
                    let (key, rv) = src.next().expect("peeked");
                    dst.next();
                    if rv > high_water {
                        observe(rv, &mut observed_max);
                        delta.updates.push(key);
                    }
                }
            },
            (Some(_), None) => {
                let (key, rv) = src.next().expect("peeked");
                observe(rv, &mut observed_max);
                delta.inserts.push(key);
            }
            (None, Some(_)) => {
                delta.deletes.push(dst.next().expect("peeked"));
            }
            (None, None) => break,
        }
    }

    delta.high_water = observed_max;
    delta
}

/// Merge for the hash strategy. Both inputs sorted ascending by key.
pub(crate) fn merge_hash(source: Vec<(Key, Vec<u8>)>, dest: Vec<(Key, Vec<u8>)>) -> TableDelta {
    let mut delta = TableDelta::default();
    let mut src = source.into_iter().peekable();
    let mut dst = dest.into_iter().peekable();

    loop {
        match (src.peek(), dst.peek()) {
            (Some((skey, _)), Some((dkey, _))) => match skey.cmp(dkey) {
                std::cmp::Ordering::Less => {
                    delta.inserts.push(src.next().expect("peeked").0);
                }
                std::cmp::Ordering::Greater => {
                    delta.deletes.push(dst.next().expect("peeked").0);
                }
                std::cmp::Ordering::Equal => {
                    let (key, shash) = src.next().expect("peeked");
                    let (_, dhash) = dst.next().expect("peeked");
                    if shash != dhash {
                        delta.updates.push(key);
                    }
                }
            },
            (Some(_), None) => {
                delta.inserts.push(src.next().expect("peeked").0);
            }
            (None, Some(_)) => {
                delta.deletes.push(dst.next().expect("peeked").0);
            }
            (None, None) => break,
        }
    }

    delta
}

// ---------------------------------------------------------------------------
// Computer
// ---------------------------------------------------------------------------

/// Computes the delta for one table over a pair of live connections.
pub struct DeltaComputer;

impl DeltaComputer {
    /// Produce the three candidate sets and the new high-water mark.
    pub async fn compute(
        source: &mut SqlServerClient,
        dest: &mut SqlServerClient,
        schema: &TableSchema,
        pk: &[String],
        filter: Option<&str>,
        strategy: &ChangeStrategy,
    ) -> Result<TableDelta> {
        let table = &schema.table;
        if pk.is_empty() {
            return Err(Error::delta(table.to_string(), "empty primary key"));
        }

        let delta = match strategy {
            ChangeStrategy::RowVersion {
                column, high_water, ..
            } => {
                let src_sql = rowversion_scan_sql(table, pk, column, filter);
                let src_rows = scan_stamped(source, &src_sql, pk.len(), table).await?;
                let src_rows = parse_rowversions(src_rows, table)?;

                let dst_sql = key_scan_sql(table, pk, filter);
                let dst_keys = scan_keys(dest, &dst_sql, table).await?;

                merge_rowversion(src_rows, dst_keys, *high_water)
            }
            ChangeStrategy::Hash => {
                let data_columns = schema.data_column_names();
                let sql = hash_scan_sql(table, pk, &data_columns, filter);
                // Same statement text on both sides: same columns, same
                // sentinel coalescing, same hash input.
                let src_rows = scan_stamped(source, &sql, pk.len(), table).await?;
                let dst_rows = scan_stamped(dest, &sql, pk.len(), table).await?;
                merge_hash(src_rows, dst_rows)
            }
        };

        debug!(
            "{}: delta computed: {} inserts, {} updates, {} deletes",
            table,
            delta.inserts.len(),
            delta.updates.len(),
            delta.deletes.len()
        );
        Ok(delta)
    }
}

/// Fetch `(key, stamp)` tuples; the stamp is the trailing column.
///
/// Rows are re-sorted locally: the merge advances by [`Key`]'s comparator,
/// which must agree between the two streams, and the server's collation
/// order is not guaranteed to match it.
async fn scan_stamped(
    client: &mut SqlServerClient,
    sql: &str,
    pk_len: usize,
    table: &TableRef,
) -> Result<Vec<(Key, Vec<u8>)>> {
    let rows = client
        .query(sql, &[])
        .await
        .map_err(|e| Error::delta(table.to_string(), e.to_string()))?;

    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = row.into_values();
        if values.len() != pk_len + 1 {
            return Err(Error::delta(
                table.to_string(),
                format!("scan returned {} columns, expected {}", values.len(), pk_len + 1),
            ));
        }
        let stamp = match values.pop() {
            Some(Value::Bytes(b)) => b,
            other => {
                return Err(Error::delta(
                    table.to_string(),
                    format!("scan stamp is not binary: {:?}", other),
                ))
            }
        };
        tuples.push((Key(values), stamp));
    }
    tuples.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(tuples)
}

/// Fetch bare keys, re-sorted locally (see [`scan_stamped`]).
async fn scan_keys(
    client: &mut SqlServerClient,
    sql: &str,
    table: &TableRef,
) -> Result<Vec<Key>> {
    let rows = client
        .query(sql, &[])
        .await
        .map_err(|e| Error::delta(table.to_string(), e.to_string()))?;

    let mut keys: Vec<Key> = rows.into_iter().map(|r| Key(r.into_values())).collect();
    keys.sort();
    Ok(keys)
}

fn parse_rowversions(
    tuples: Vec<(Key, Vec<u8>)>,
    table: &TableRef,
) -> Result<Vec<(Key, RowVersion)>> {
    tuples
        .into_iter()
        .map(|(key, stamp)| {
            RowVersion::from_slice(&stamp)
                .map(|rv| (key, rv))
                .ok_or_else(|| {
                    Error::delta(
                        table.to_string(),
                        format!("rowversion stamp has {} bytes, expected 8", stamp.len()),
                    )
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: i32) -> Key {
        Key(vec![Value::Int32(n)])
    }

    fn rv(n: u8) -> RowVersion {
        RowVersion::new([0, 0, 0, 0, 0, 0, 0, n])
    }

    #[test]
    fn test_fresh_mirror_all_inserts() {
        // Source rows 1..=3, destination empty
        let source = vec![(key(1), rv(1)), (key(2), rv(2)), (key(3), rv(3))];
        let delta = merge_rowversion(source, vec![], RowVersion::ZERO);

        assert_eq!(delta.inserts, vec![key(1), key(2), key(3)]);
        assert!(delta.updates.is_empty());
        assert!(delta.deletes.is_empty());
        assert_eq!(delta.high_water, Some(rv(3)));
    }

    #[test]
    fn test_incremental_update_above_high_water() {
        // Row 2 changed since the last run (stamp 5 > hwm 3)
        let source = vec![(key(1), rv(1)), (key(2), rv(5)), (key(3), rv(3))];
        let dest = vec![key(1), key(2), key(3)];
        let delta = merge_rowversion(source, dest, rv(3));

        assert!(delta.inserts.is_empty());
        assert_eq!(delta.updates, vec![key(2)]);
        assert!(delta.deletes.is_empty());
        assert_eq!(delta.high_water, Some(rv(5)));
    }

    #[test]
    fn test_second_run_is_empty() {
        // Nothing above the mark and the key sets match: zero writes
        let source = vec![(key(1), rv(1)), (key(2), rv(2))];
        let dest = vec![key(1), key(2)];
        let delta = merge_rowversion(source, dest, rv(2));

        assert!(delta.is_empty());
        assert_eq!(delta.high_water, None);
    }

    #[test]
    fn test_delete_only_on_dest() {
        let source = vec![(key(2), rv(2))];
        let dest = vec![key(1), key(2), key(9)];
        let delta = merge_rowversion(source, dest, rv(2));

        assert_eq!(delta.deletes, vec![key(1), key(9)]);
        assert!(delta.inserts.is_empty());
        assert!(delta.updates.is_empty());
    }

    #[test]
    fn test_insert_below_high_water_still_inserted() {
        // A row older than the mark but missing at the destination must
        // still be inserted; the monotonic ledger clamp handles the mark.
        let source = vec![(key(1), rv(1))];
        let delta = merge_rowversion(source, vec![], rv(9));
        assert_eq!(delta.inserts, vec![key(1)]);
        assert_eq!(delta.high_water, Some(rv(1)));
    }

    #[test]
    fn test_sets_ordered_by_key() {
        let source = vec![
            (key(1), rv(9)),
            (key(3), rv(9)),
            (key(5), rv(9)),
            (key(7), rv(9)),
        ];
        let dest = vec![key(2), key(3), key(5), key(6)];
        let delta = merge_rowversion(source, dest, RowVersion::ZERO);

        assert_eq!(delta.inserts, vec![key(1), key(7)]);
        assert_eq!(delta.updates, vec![key(3), key(5)]);
        assert_eq!(delta.deletes, vec![key(2), key(6)]);
    }

    #[test]
    fn test_hash_merge_detects_single_difference() {
        let source = vec![
            (key(4), b"aaaa".to_vec()),
            (key(5), b"changed".to_vec()),
            (key(6), b"cccc".to_vec()),
        ];
        let dest = vec![
            (key(4), b"aaaa".to_vec()),
            (key(5), b"original".to_vec()),
            (key(6), b"cccc".to_vec()),
        ];
        let delta = merge_hash(source, dest);

        assert!(delta.inserts.is_empty());
        assert_eq!(delta.updates, vec![key(5)]);
        assert!(delta.deletes.is_empty());
        assert_eq!(delta.high_water, None);
    }

    #[test]
    fn test_hash_merge_three_way() {
        let source = vec![(key(1), b"a".to_vec()), (key(3), b"x".to_vec())];
        let dest = vec![(key(2), b"b".to_vec()), (key(3), b"y".to_vec())];
        let delta = merge_hash(source, dest);

        assert_eq!(delta.inserts, vec![key(1)]);
        assert_eq!(delta.updates, vec![key(3)]);
        assert_eq!(delta.deletes, vec![key(2)]);
        assert_eq!(delta.total(), 3);
    }

    #[test]
    fn test_composite_key_merge_uses_all_columns() {
        let k = |a: i32, b: &str, c: i32| {
            Key(vec![
                Value::Int32(a),
                Value::String(b.into()),
                Value::Int32(c),
            ])
        };
        // Same first two columns, third differs: distinct keys
        let source = vec![(k(1, "x", 1), rv(1)), (k(1, "x", 2), rv(1))];
        let dest = vec![k(1, "x", 1)];
        let delta = merge_rowversion(source, dest, RowVersion::ZERO);

        assert_eq!(delta.inserts, vec![k(1, "x", 2)]);
        assert_eq!(delta.updates, vec![k(1, "x", 1)]);
    }

    #[test]
    fn test_key_scan_sql_filter_and_order() {
        let table = TableRef::new("dbo", "Customer");
        let pk = vec!["Id".to_string()];

        let sql = key_scan_sql(&table, &pk, Some("Sucursal = 1"));
        assert_eq!(
            sql,
            "SELECT [Id] FROM [dbo].[Customer] WHERE (Sucursal = 1) ORDER BY [Id] ASC"
        );

        let sql = key_scan_sql(&table, &pk, None);
        assert!(!sql.contains("WHERE"));
    }

    #[test]
    fn test_rowversion_scan_sql() {
        let table = TableRef::new("dbo", "Customer");
        let pk = vec!["Id".to_string()];
        let sql = rowversion_scan_sql(&table, &pk, "RV", Some("Active = 1"));
        assert_eq!(
            sql,
            "SELECT [Id], [RV] FROM [dbo].[Customer] WHERE (Active = 1) ORDER BY [Id] ASC"
        );
    }

    #[test]
    fn test_hash_scan_sql_sentinels() {
        let table = TableRef::new("dbo", "Customer");
        let pk = vec!["Id".to_string()];
        let cols = vec!["Id".to_string(), "Name".to_string()];
        let sql = hash_scan_sql(&table, &pk, &cols, None);

        assert!(sql.contains("HASHBYTES('SHA2_256'"));
        assert!(sql.contains("CONCAT_WS(NCHAR(30)"));
        assert!(sql.contains("COALESCE(CONVERT(NVARCHAR(MAX), [Name]), NCHAR(26))"));
        assert!(sql.ends_with("ORDER BY [Id] ASC"));
    }

    #[test]
    fn test_hash_scan_sql_identical_for_both_sides() {
        // Filter symmetry: detection runs the same statement text against
        // source and destination
        let table = TableRef::new("dbo", "Customer");
        let pk = vec!["Id".to_string()];
        let cols = vec!["Id".to_string()];
        let a = hash_scan_sql(&table, &pk, &cols, Some("Sucursal = 1"));
        let b = hash_scan_sql(&table, &pk, &cols, Some("Sucursal = 1"));
        assert_eq!(a, b);
        assert!(a.contains("WHERE (Sucursal = 1)"));
    }

    #[test]
    fn test_composite_pk_order_by() {
        let table = TableRef::new("dbo", "OrderLine");
        let pk = vec!["OrderId".to_string(), "LineNo".to_string()];
        let sql = key_scan_sql(&table, &pk, None);
        assert!(sql.ends_with("ORDER BY [OrderId] ASC, [LineNo] ASC"));
    }
}
