//! Streaming reads through a server-side cursor.
//!
//! The cursor lives in a read-only transaction on a dedicated pooled
//! connection: `DECLARE ... NO SCROLL CURSOR`, then `FETCH FORWARD n` per
//! batch, then `CLOSE` and `COMMIT`. Only one batch is held in memory.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::Object;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::Row as PgRow;
use tracing::{debug, warn};

use crate::core::traits::RowCursor;
use crate::core::value::{Batch, Row, SqlValue};
use crate::error::{Result, RowMergeError};

const CURSOR_NAME: &str = "rowmerge_cursor";

/// Server-side cursor over one SELECT.
pub struct PgCursor {
    client: Option<Object>,
    columns: Arc<[String]>,
    exhausted: bool,
}

impl PgCursor {
    /// Begin a read-only transaction on `client` and declare the cursor.
    pub(crate) async fn open(client: Object, select: &str) -> Result<Self> {
        let statement = client
            .prepare(select)
            .await
            .map_err(|e| RowMergeError::query(&e, select))?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        client
            .batch_execute("BEGIN READ ONLY")
            .await
            .map_err(|e| RowMergeError::query(&e, "BEGIN READ ONLY"))?;

        let declare = format!("DECLARE {} NO SCROLL CURSOR FOR {}", CURSOR_NAME, select);
        if let Err(e) = client.batch_execute(&declare).await {
            // the transaction is aborted; don't hand the connection back
            let _ = Object::take(client);
            return Err(RowMergeError::query(&e, declare));
        }
        debug!("Declared cursor for: {}", select);

        Ok(Self {
            client: Some(client),
            columns: Arc::from(columns),
            exhausted: false,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

#[async_trait]
impl RowCursor for PgCursor {
    async fn fetch(&mut self, max_rows: usize) -> Result<Batch> {
        if self.exhausted {
            return Ok(Batch::new(Vec::new(), true));
        }
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| RowMergeError::Validation("fetch on a closed cursor".into()))?;

        let fetch = format!("FETCH FORWARD {} FROM {}", max_rows, CURSOR_NAME);
        let rows = client
            .query(fetch.as_str(), &[])
            .await
            .map_err(|e| RowMergeError::query(&e, &fetch))?;

        let mut batch_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = (0..row.len())
                .map(|idx| convert_pg_row_value(row, idx))
                .collect::<Result<Vec<_>>>()?;
            batch_rows.push(Row::new(Arc::clone(&self.columns), values)?);
        }

        let is_last = batch_rows.len() < max_rows;
        self.exhausted = is_last;
        Ok(Batch::new(batch_rows, is_last))
    }

    async fn close(&mut self) -> Result<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        let close = format!("CLOSE {}; COMMIT", CURSOR_NAME);
        if let Err(e) = client.batch_execute(&close).await {
            let _ = Object::take(client);
            return Err(RowMergeError::query(&e, close));
        }
        Ok(())
    }
}

impl Drop for PgCursor {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!("Cursor dropped while open; discarding its connection");
            let _ = Object::take(client);
        }
    }
}

/// Decode one column of a fetched row by its wire type.
///
/// Only natively mapped column types reach this point; everything else is
/// projected as `::text` by the cursor SELECT.
fn convert_pg_row_value(row: &PgRow, idx: usize) -> Result<SqlValue> {
    let ty = row.columns()[idx].type_();

    let value = match ty.name() {
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        "int2" => row.try_get::<_, Option<i16>>(idx)?.map(SqlValue::I16),
        "int4" => row.try_get::<_, Option<i32>>(idx)?.map(SqlValue::I32),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::I64),
        "float4" => row.try_get::<_, Option<f32>>(idx)?.map(SqlValue::F32),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::F64),
        // NaN, infinities and values beyond Decimal's range come back as text
        "numeric" => match row.try_get::<_, Option<rust_decimal::Decimal>>(idx) {
            Ok(value) => value.map(SqlValue::Decimal),
            Err(_) => row
                .try_get::<_, Option<NumericText>>(idx)?
                .map(|n| SqlValue::Text(n.0)),
        },
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(SqlValue::Date),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(SqlValue::DateTime),
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(SqlValue::Json),
        _ => row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text),
    };

    Ok(value.unwrap_or(SqlValue::Null))
}

/// Canonical text of a binary `numeric` value.
///
/// Wire layout: ndigits, weight, sign and dscale as 16-bit integers, then
/// `ndigits` base-10000 digits. `weight` is the power of 10000 of the first
/// digit.
struct NumericText(String);

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let word = |i: usize| -> std::result::Result<u16, Box<dyn std::error::Error + Sync + Send>> {
            raw.get(i * 2..i * 2 + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or_else(|| "truncated numeric value".into())
        };

        let ndigits = word(0)? as i16;
        let weight = word(1)? as i16 as i32;
        let sign = word(2)?;
        let dscale = word(3)? as usize;

        match sign {
            NUMERIC_NAN => return Ok(NumericText("NaN".into())),
            NUMERIC_PINF => return Ok(NumericText("Infinity".into())),
            NUMERIC_NINF => return Ok(NumericText("-Infinity".into())),
            0 | NUMERIC_NEG => {}
            other => return Err(format!("invalid numeric sign {:#06x}", other).into()),
        }
        if ndigits < 0 {
            return Err("negative numeric digit count".into());
        }

        let digits = (0..ndigits as usize)
            .map(|i| word(4 + i))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let digit = |i: i32| -> u16 {
            usize::try_from(i)
                .ok()
                .and_then(|i| digits.get(i).copied())
                .unwrap_or(0)
        };

        let mut out = String::new();
        if sign == NUMERIC_NEG {
            out.push('-');
        }
        if weight < 0 {
            out.push('0');
        } else {
            out.push_str(&digit(0).to_string());
            for i in 1..=weight {
                out.push_str(&format!("{:04}", digit(i)));
            }
        }

        if dscale > 0 {
            let mut fraction = String::with_capacity(dscale + 4);
            let mut i = weight + 1;
            while fraction.len() < dscale {
                fraction.push_str(&format!("{:04}", digit(i)));
                i += 1;
            }
            fraction.truncate(dscale);
            out.push('.');
            out.push_str(&fraction);
        }

        Ok(NumericText(out))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}
