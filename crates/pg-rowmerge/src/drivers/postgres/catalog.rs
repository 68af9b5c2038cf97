//! Table metadata from the system catalogs.

use async_trait::async_trait;
use tracing::debug;

use super::PgDatabase;
use crate::core::identifier::{Ident, TableName};
use crate::core::schema::{ColumnDescriptor, TableDescriptor};
use crate::core::traits::{Catalog, TypeMapper};
use crate::error::{Result, RowMergeError};

const TABLE_QUERY: &str = r#"
    SELECT c.oid
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1
      AND c.relname = $2
      AND c.relkind IN ('r', 'p', 'v', 'm', 'f')
"#;

const COLUMNS_QUERY: &str = r#"
    SELECT a.attname::text, pg_catalog.format_type(a.atttypid, a.atttypmod)
    FROM pg_catalog.pg_attribute a
    WHERE a.attrelid = $1
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

#[async_trait]
impl Catalog for PgDatabase {
    async fn describe_table(&self, table: &TableName) -> Result<Option<TableDescriptor>> {
        let client = self.client("describing table").await?;

        let found = client
            .query_opt(TABLE_QUERY, &[&table.schema.as_str(), &table.name.as_str()])
            .await
            .map_err(|e| RowMergeError::query(&e, TABLE_QUERY.trim()))?;
        let oid: u32 = match found {
            Some(row) => row.try_get(0)?,
            None => return Ok(None),
        };

        let rows = client
            .query(COLUMNS_QUERY, &[&oid])
            .await
            .map_err(|e| RowMergeError::query(&e, COLUMNS_QUERY.trim()))?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0)?;
            let sql_type: String = row.try_get(1)?;
            columns.push(ColumnDescriptor::new(
                Ident::new(name)?,
                self.mapper.column_type(&sql_type),
                sql_type,
            ));
        }

        debug!("Loaded {} columns for {}", columns.len(), table);
        Ok(Some(TableDescriptor::new(table.clone(), columns)))
    }

    async fn table_exists(&self, table: &TableName) -> Result<bool> {
        let client = self.client("checking table existence").await?;
        let found = client
            .query_opt(TABLE_QUERY, &[&table.schema.as_str(), &table.name.as_str()])
            .await
            .map_err(|e| RowMergeError::query(&e, TABLE_QUERY.trim()))?;
        Ok(found.is_some())
    }

    async fn row_count(&self, table: &TableName) -> Result<i64> {
        let client = self.client("counting rows").await?;
        let query = format!("SELECT COUNT(*)::int8 FROM {}", table.qualified());
        let row = client
            .query_one(&query, &[])
            .await
            .map_err(|e| RowMergeError::query(&e, &query))?;
        Ok(row.try_get::<_, i64>(0)?)
    }
}
