//! Row and value types exchanged between the cursor, the caller's
//! transform and the literal compiler.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Result, RowMergeError};

/// An application value.
///
/// Values are rendered according to the declared type of the column they
/// belong to, never according to their own variant alone: a `Text("1")`
/// headed for a boolean column becomes `true`, and the same text headed for a
/// date column is parsed with the configured date format.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(Decimal),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),

    Date(NaiveDate),
    Time(NaiveTime),

    /// Structured JSON document (object, array or scalar).
    Json(serde_json::Value),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Short variant name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::I16(_) => "i16",
            SqlValue::I32(_) => "i32",
            SqlValue::I64(_) => "i64",
            SqlValue::F32(_) => "f32",
            SqlValue::F64(_) => "f64",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "bytes",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::Decimal(_) => "decimal",
            SqlValue::DateTime(_) => "datetime",
            SqlValue::DateTimeOffset(_) => "datetimeoffset",
            SqlValue::Date(_) => "date",
            SqlValue::Time(_) => "time",
            SqlValue::Json(_) => "json",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of integral variants.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(v) => Some(*v as i64),
            SqlValue::I32(v) => Some(*v as i64),
            SqlValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Floating point view of numeric variants.
    pub fn as_f64(&self) -> Option<f64> {
        use rust_decimal::prelude::ToPrimitive;
        match self {
            SqlValue::I16(v) => Some(*v as f64),
            SqlValue::I32(v) => Some(*v as f64),
            SqlValue::I64(v) => Some(*v as f64),
            SqlValue::F32(v) => Some(*v as f64),
            SqlValue::F64(v) => Some(*v),
            SqlValue::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::I16(v) => write!(f, "{}", v),
            SqlValue::I32(v) => write!(f, "{}", v),
            SqlValue::I64(v) => write!(f, "{}", v),
            SqlValue::F32(v) => write!(f, "{}", v),
            SqlValue::F64(v) => write!(f, "{}", v),
            SqlValue::Text(v) => f.write_str(v),
            SqlValue::Bytes(v) => write!(f, "\\x{}", hex::encode(v)),
            SqlValue::Uuid(v) => write!(f, "{}", v),
            SqlValue::Decimal(v) => write!(f, "{}", v),
            SqlValue::DateTime(v) => write!(f, "{}", v),
            SqlValue::DateTimeOffset(v) => write!(f, "{}", v.to_rfc3339()),
            SqlValue::Date(v) => write!(f, "{}", v),
            SqlValue::Time(v) => write!(f, "{}", v),
            SqlValue::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A row read from the cursor.
///
/// Values are aligned positionally to a column list that is fixed for the
/// whole pipeline run and shared between all rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Build a row; fails if `values` does not match `columns` in length.
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Result<Self> {
        if columns.len() != values.len() {
            return Err(RowMergeError::ArityMismatch {
                context: "row".to_string(),
                expected: columns.len(),
                actual: values.len(),
            });
        }
        Ok(Self { columns, values })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of the named column.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.position(column).map(|i| &self.values[i])
    }

    /// Overwrite the named column, failing if the row has no such column.
    pub fn set(&mut self, column: &str, value: impl Into<SqlValue>) -> Result<()> {
        let idx = self
            .position(column)
            .ok_or_else(|| RowMergeError::UnknownColumn {
                table: "row".to_string(),
                columns: vec![column.to_string()],
            })?;
        self.values[idx] = value.into();
        Ok(())
    }

    /// Copy of this row with `column` replaced, as a transform result.
    pub fn replace(&self, column: &str, value: impl Into<SqlValue>) -> Result<RowUpdate> {
        let mut row = self.clone();
        row.set(column, value)?;
        Ok(RowUpdate::Replace(row.into_values()))
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Result of applying a row transform.
#[derive(Debug, Clone, PartialEq)]
pub enum RowUpdate {
    /// Leave the row untouched; nothing is staged for it.
    Keep,

    /// Stage this replacement, positionally aligned with the input row.
    Replace(Vec<SqlValue>),
}

/// One cursor fetch.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub rows: Vec<Row>,

    /// No further rows follow this batch.
    pub is_last: bool,
}

impl Batch {
    pub fn new(rows: Vec<Row>, is_last: bool) -> Self {
        Self { rows, is_last }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
