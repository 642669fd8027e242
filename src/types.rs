//! Value and identity types.
//!
//! - [`Value`]/[`Row`]: the SQL value model used for all row data
//! - [`RowVersion`]: SQL Server's 8-byte per-row version stamp
//! - [`TableRef`]: schema-qualified table identity (case-insensitive equality)
//! - [`Key`]: a primary-key tuple with a total ordering for merge scans

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// SQL value that can hold any column value this crate reads or writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// BIT
    Bool(bool),
    /// TINYINT (unsigned in SQL Server)
    TinyInt(u8),
    /// SMALLINT
    Int16(i16),
    /// INT
    Int32(i32),
    /// BIGINT
    Int64(i64),
    /// REAL
    Float32(f32),
    /// FLOAT
    Float64(f64),
    /// DECIMAL / NUMERIC / MONEY
    Decimal(Decimal),
    /// CHAR / VARCHAR / NCHAR / NVARCHAR / text types
    String(String),
    /// BINARY / VARBINARY / ROWVERSION payloads
    Bytes(Vec<u8>),
    /// DATE
    Date(NaiveDate),
    /// TIME
    Time(NaiveTime),
    /// DATETIME / DATETIME2 / SMALLDATETIME
    DateTime(NaiveDateTime),
    /// DATETIMEOFFSET
    DateTimeTz(DateTime<Utc>),
    /// UNIQUEIDENTIFIER
    Uuid(Uuid),
}

impl Value {
    /// Check if the value is NULL.
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to read as i64 (widening integer conversions only).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::TinyInt(n) => Some(i64::from(*n)),
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to read as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::TinyInt(n) => Some(*n != 0),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// Try to read as &str.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to read as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Try to read as a timestamp.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::DateTime(dt) => Some(*dt),
            Self::DateTimeTz(dt) => Some(dt.naive_utc()),
            _ => None,
        }
    }

    /// Variant rank used for the cross-type total ordering.
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::TinyInt(_) | Self::Int16(_) | Self::Int32(_) | Self::Int64(_) => 2,
            Self::Float32(_) | Self::Float64(_) => 3,
            Self::Decimal(_) => 4,
            Self::String(_) => 5,
            Self::Bytes(_) => 6,
            Self::Date(_) => 7,
            Self::Time(_) => 8,
            Self::DateTime(_) => 9,
            Self::DateTimeTz(_) => 10,
            Self::Uuid(_) => 11,
        }
    }

    /// Total ordering over values.
    ///
    /// Integers compare numerically across widths. Strings compare
    /// case-insensitively, matching the server-side ORDER BY both delta scan
    /// streams were produced with (SQL Server default collations are
    /// case-insensitive); ties break case-sensitively so the order stays
    /// total. Mixed types order by variant rank; NULL sorts first.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (String(a), String(b)) => {
                let folded = a
                    .chars()
                    .flat_map(char::to_lowercase)
                    .cmp(b.chars().flat_map(char::to_lowercase));
                folded.then_with(|| a.cmp(b))
            }
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (DateTimeTz(a), DateTimeTz(b)) => a.cmp(b),
            (Uuid(a), Uuid(b)) => a.cmp(b),
            (Float32(a), Float32(b)) => a.total_cmp(b),
            (Float64(a), Float64(b)) => a.total_cmp(b),
            (Float32(a), Float64(b)) => f64::from(*a).total_cmp(b),
            (Float64(a), Float32(b)) => a.total_cmp(&f64::from(*b)),
            _ => match (self.as_i64(), other.as_i64()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Database row as ordered column values.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row. Column and value counts must match.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Column count.
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names.
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All values in column order.
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value by column index.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value by column name (case-insensitive).
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Consume the row into its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// SQL Server's 8-byte ROWVERSION stamp.
///
/// Opaque, server-assigned, monotonically increasing per database. Ordering
/// is big-endian byte order, which is how the server compares the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowVersion(pub [u8; 8]);

impl RowVersion {
    /// The zero stamp (`0x0000000000000000`), lower than every real stamp.
    pub const ZERO: RowVersion = RowVersion([0u8; 8]);

    /// Create from raw bytes.
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create from a slice; fails unless exactly 8 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 8]>::try_from(bytes).ok().map(Self)
    }

    /// Parse from a 16-character hex string.
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        Self::from_slice(&bytes)
    }

    /// Render as a 16-character lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Whether this is the zero stamp.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl std::fmt::Display for RowVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

/// Schema-qualified table identity.
///
/// Case is preserved for display and DDL; equality and hashing are
/// case-insensitive, matching SQL Server identifier resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema name, e.g. `dbo`
    pub schema: String,
    /// Table name
    pub name: String,
}

impl TableRef {
    /// Create a new table reference.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Bracket-quoted qualified name, e.g. `[dbo].[Customer]`.
    pub fn qualified(&self) -> String {
        format!(
            "{}.{}",
            crate::security::quote_identifier(&self.schema),
            crate::security::quote_identifier(&self.name)
        )
    }
}

impl PartialEq for TableRef {
    fn eq(&self, other: &Self) -> bool {
        self.schema.eq_ignore_ascii_case(&other.schema)
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for TableRef {}

impl std::hash::Hash for TableRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for c in self.schema.chars() {
            c.to_ascii_lowercase().hash(state);
        }
        '.'.hash(state);
        for c in self.name.chars() {
            c.to_ascii_lowercase().hash(state);
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

/// A primary-key tuple with a total ordering.
///
/// Delta scans stream `(Key, stamp)` pairs from both databases in PK order;
/// the merge in [`crate::delta`] advances two cursors by comparing keys, so
/// [`Ord`] here must agree with the server's ORDER BY (see
/// [`Value::total_cmp`] for the string caveat).
#[derive(Debug, Clone, PartialEq)]
pub struct Key(pub Vec<Value>);

impl Key {
    /// Number of key columns.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key tuple is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key values in PK-column order.
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}
