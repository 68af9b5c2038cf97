//! Typed literal rendering.
//!
//! Every value is rendered according to the declared [`ColumnType`] of the
//! column it belongs to. The runtime variant of the value only decides how it
//! is coerced, never which SQL type it ends up as. Used only for the bulk
//! VALUES path, where binding thousands of heterogeneous parameters is not
//! practical.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

use crate::config::LiteralFormats;
use crate::core::identifier::Ident;
use crate::core::value::SqlValue;
use crate::error::{Result, RowMergeError};
use crate::typemap::ColumnType;

/// Output format for `date` literals.
const ISO_DATE: &str = "%Y-%m-%d";

/// Output format for `timestamp` literals; microseconds match PostgreSQL.
const ISO_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Escape a string for use inside a single-quoted SQL literal.
pub fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Render a string as a quoted SQL literal.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", escape_sql_string(s))
}

/// Renders application values as SQL literals typed by their column.
#[derive(Debug, Clone, Default)]
pub struct TypedLiteralCompiler {
    formats: LiteralFormats,
}

impl TypedLiteralCompiler {
    pub fn new(formats: LiteralFormats) -> Self {
        Self { formats }
    }

    pub fn formats(&self) -> &LiteralFormats {
        &self.formats
    }

    /// Render one row as a parenthesised tuple: `(1, 'a', NULL)`.
    ///
    /// `columns`, `types` and `values` must have the same length.
    pub fn render_tuple(
        &self,
        columns: &[Ident],
        types: &[ColumnType],
        values: &[SqlValue],
    ) -> Result<String> {
        check_arity("column types", columns.len(), types.len())?;
        check_arity("value row", columns.len(), values.len())?;

        let rendered = columns
            .iter()
            .zip(types)
            .zip(values)
            .map(|((col, ty), value)| self.render(col.as_str(), ty, value))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", rendered.join(", ")))
    }

    /// Render a single value for a column of type `column_type`.
    pub fn render(&self, column: &str, column_type: &ColumnType, value: &SqlValue) -> Result<String> {
        if value.is_null() {
            return Ok("NULL".to_string());
        }

        match column_type {
            ColumnType::Date => {
                let date = self.coerce_date(column, value)?;
                Ok(format!("'{}'::date", date.format(ISO_DATE)))
            }
            ColumnType::DateTime => {
                let ts = self.coerce_timestamp(column, value)?;
                Ok(format!("'{}'::timestamp", ts.format(ISO_TIMESTAMP)))
            }
            ColumnType::Json => Ok(format!("{}::json", quote_literal(&json_text(value)))),
            ColumnType::Jsonb => Ok(format!("{}::jsonb", quote_literal(&json_text(value)))),
            ColumnType::Text => {
                let text = value.to_string();
                if text.contains('\0') {
                    return Err(RowMergeError::literal(
                        column,
                        "text values cannot contain NUL bytes",
                    ));
                }
                Ok(quote_literal(&text))
            }
            ColumnType::Numeric | ColumnType::Float => render_numeric(column, column_type, value),
            ColumnType::Integer | ColumnType::BigInteger => {
                Ok(coerce_integer(column, value)?.to_string())
            }
            ColumnType::Boolean => Ok(coerce_bool(column, value)?.to_string()),
            ColumnType::LargeBinary => match value {
                SqlValue::Bytes(b) => Ok(format!("'\\x{}'::bytea", hex::encode(b))),
                SqlValue::Text(s) => Ok(format!("{}::bytea", quote_literal(s))),
                other => Err(mismatch(column, column_type, other)),
            },
            ColumnType::Geometry | ColumnType::Unmapped(_) => {
                let raw = match value {
                    SqlValue::Json(v) => v.to_string(),
                    other => other.to_string(),
                };
                Ok(quote_literal(&raw))
            }
        }
    }

    fn coerce_date(&self, column: &str, value: &SqlValue) -> Result<NaiveDate> {
        match value {
            SqlValue::Date(d) => Ok(*d),
            SqlValue::DateTime(dt) => Ok(dt.date()),
            SqlValue::DateTimeOffset(dt) => Ok(dt.naive_local().date()),
            SqlValue::Text(s) => {
                let s = s.trim();
                NaiveDate::parse_from_str(s, &self.formats.date)
                    .or_else(|_| {
                        NaiveDateTime::parse_from_str(s, &self.formats.timestamp).map(|dt| dt.date())
                    })
                    .map_err(|e| {
                        RowMergeError::literal(
                            column,
                            format!(
                                "'{}' does not match date format '{}': {}",
                                s, self.formats.date, e
                            ),
                        )
                    })
            }
            other => Err(mismatch(column, &ColumnType::Date, other)),
        }
    }

    fn coerce_timestamp(&self, column: &str, value: &SqlValue) -> Result<NaiveDateTime> {
        match value {
            SqlValue::DateTime(dt) => Ok(*dt),
            SqlValue::DateTimeOffset(dt) => Ok(dt.naive_local()),
            SqlValue::Date(d) => Ok(d.and_time(NaiveTime::MIN)),
            SqlValue::Text(s) => {
                let s = s.trim();
                NaiveDateTime::parse_from_str(s, &self.formats.timestamp)
                    .or_else(|_| {
                        NaiveDate::parse_from_str(s, &self.formats.date)
                            .map(|d| d.and_time(NaiveTime::MIN))
                    })
                    .map_err(|e| {
                        RowMergeError::literal(
                            column,
                            format!(
                                "'{}' does not match timestamp format '{}': {}",
                                s, self.formats.timestamp, e
                            ),
                        )
                    })
            }
            other => Err(mismatch(column, &ColumnType::DateTime, other)),
        }
    }
}

/// Fail with `ArityMismatch` unless `actual == expected`.
pub(crate) fn check_arity(context: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(RowMergeError::ArityMismatch {
            context: context.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn mismatch(column: &str, column_type: &ColumnType, value: &SqlValue) -> RowMergeError {
    RowMergeError::literal(
        column,
        format!("cannot use a {} value for a {:?} column", value.kind(), column_type),
    )
}

/// JSON text for a value headed for a json/jsonb column.
///
/// Structured values are serialized; text is assumed to already be JSON.
fn json_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Json(v) => v.to_string(),
        SqlValue::Text(s) => s.clone(),
        SqlValue::Bool(b) => serde_json::Value::Bool(*b).to_string(),
        SqlValue::Decimal(d) => d.to_string(),
        other => match other.as_f64() {
            Some(_) => other.to_string(),
            None => serde_json::Value::String(other.to_string()).to_string(),
        },
    }
}

fn render_numeric(column: &str, column_type: &ColumnType, value: &SqlValue) -> Result<String> {
    // Exact decimals keep their digits for numeric columns.
    match (column_type, value) {
        (ColumnType::Numeric, SqlValue::Decimal(d)) => return Ok(d.normalize().to_string()),
        (ColumnType::Numeric, SqlValue::Text(s)) if is_decimal_literal(s.trim()) => {
            return Ok(s.trim().to_string())
        }
        _ => {}
    }

    let f = match value {
        SqlValue::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        SqlValue::Text(s) => s.trim().parse::<f64>().map_err(|_| {
            RowMergeError::literal(column, format!("'{}' is not a number", s))
        })?,
        other => other
            .as_f64()
            .ok_or_else(|| mismatch(column, column_type, other))?,
    };
    Ok(float_literal(f))
}

/// `[-+]digits[.digits][e[-+]digits]`, with at least one mantissa digit.
fn is_decimal_literal(s: &str) -> bool {
    let s = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (mantissa, exponent) = match s.find(['e', 'E']) {
        Some(i) => (&s[..i], Some(&s[i + 1..])),
        None => (s, None),
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let all_digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    let mantissa_ok = !(int.is_empty() && frac.is_empty()) && all_digits(int) && all_digits(frac);
    let exponent_ok = exponent.map_or(true, |e| {
        let e = e.strip_prefix(['-', '+']).unwrap_or(e);
        !e.is_empty() && all_digits(e)
    });
    mantissa_ok && exponent_ok
}

fn float_literal(f: f64) -> String {
    if f.is_nan() {
        "'NaN'".to_string()
    } else if f == f64::INFINITY {
        "'Infinity'".to_string()
    } else if f == f64::NEG_INFINITY {
        "'-Infinity'".to_string()
    } else {
        format!("{}", f)
    }
}

fn coerce_integer(column: &str, value: &SqlValue) -> Result<i64> {
    let out_of_range = || RowMergeError::literal(column, format!("{} is not an integer", value));
    match value {
        SqlValue::Bool(b) => Ok(i64::from(*b)),
        SqlValue::F32(_) | SqlValue::F64(_) => {
            let f = value.as_f64().ok_or_else(out_of_range)?;
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Ok(f as i64)
            } else {
                Err(out_of_range())
            }
        }
        SqlValue::Decimal(d) => {
            use rust_decimal::prelude::ToPrimitive;
            if d.fract() == Decimal::ZERO {
                d.to_i64().ok_or_else(out_of_range)
            } else {
                Err(out_of_range())
            }
        }
        SqlValue::Text(s) => s.trim().parse::<i64>().map_err(|_| out_of_range()),
        other => other
            .as_i64()
            .ok_or_else(|| mismatch(column, &ColumnType::BigInteger, other)),
    }
}

fn coerce_bool(column: &str, value: &SqlValue) -> Result<bool> {
    match value {
        SqlValue::Bool(b) => Ok(*b),
        SqlValue::Text(s) => match s.trim().to_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => Ok(true),
            "f" | "false" | "n" | "no" | "off" | "0" => Ok(false),
            _ => Err(RowMergeError::literal(
                column,
                format!("'{}' is not a boolean", s),
            )),
        },
        other => match other.as_f64() {
            Some(f) => Ok(f != 0.0),
            None => Err(mismatch(column, &ColumnType::Boolean, other)),
        },
    }
}
