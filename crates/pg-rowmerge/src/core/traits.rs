//! Core traits consumed by the staging, merge and pipeline code.
//!
//! - [`Catalog`]: resolves table names to column metadata
//! - [`Session`]: executes generated statements and opens streaming cursors
//! - [`RowCursor`]: incremental fetch over one SELECT
//! - [`TypeMapper`]: maps declared or native types to [`ColumnType`]
//! - [`RowTransform`]: the caller's per-row transformation
//!
//! The PostgreSQL driver implements the database traits; unit tests use an
//! in-memory implementation.

use async_trait::async_trait;

use crate::core::identifier::TableName;
use crate::core::schema::TableDescriptor;
use crate::core::value::{Batch, Row, RowUpdate};
use crate::error::Result;
use crate::typemap::ColumnType;

/// Table metadata lookups.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolve a table; `None` if it does not exist.
    async fn describe_table(&self, table: &TableName) -> Result<Option<TableDescriptor>>;

    async fn table_exists(&self, table: &TableName) -> Result<bool> {
        Ok(self.describe_table(table).await?.is_some())
    }

    /// Exact number of rows currently in the table.
    async fn row_count(&self, table: &TableName) -> Result<i64>;
}

/// Statement execution against the configured data source.
#[async_trait]
pub trait Session: Send + Sync {
    /// Execute one statement in its own implicit transaction and return the
    /// number of rows it affected.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Open a server-side cursor over `select`.
    ///
    /// The cursor keeps its connection for as long as it is open, so other
    /// statements issued meanwhile run on other connections.
    async fn open_cursor(&self, select: &str) -> Result<Box<dyn RowCursor>>;
}

/// Incremental reader over one query result.
#[async_trait]
pub trait RowCursor: Send {
    /// Fetch up to `max_rows` rows. A batch shorter than `max_rows` is the
    /// last one and is flagged `is_last`.
    async fn fetch(&mut self, max_rows: usize) -> Result<Batch>;

    /// Close the cursor and release its connection. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Everything the pipeline needs from a database.
pub trait Database: Catalog + Session + 'static {}

impl<T: Catalog + Session + 'static> Database for T {}

/// Maps declared type names and native driver types to [`ColumnType`].
pub trait TypeMapper: Send + Sync {
    /// Map a logical or declared type name (`numeric(10,2)`, `jsonb`, `unicode`).
    fn column_type(&self, type_name: &str) -> ColumnType;

    /// Map a native driver type.
    fn column_type_for_native(&self, ty: &tokio_postgres::types::Type) -> ColumnType;

    /// Canonical type string for a column type.
    fn type_string(&self, column_type: &ColumnType) -> String;
}

/// A caller-supplied per-row transformation.
///
/// Implemented for any `FnMut(&Row) -> Result<RowUpdate>`, so closures can
/// be passed directly. Returning an error aborts the pipeline run.
pub trait RowTransform: Send {
    fn apply(&mut self, row: &Row) -> Result<RowUpdate>;
}

impl<F> RowTransform for F
where
    F: FnMut(&Row) -> Result<RowUpdate> + Send,
{
    fn apply(&mut self, row: &Row) -> Result<RowUpdate> {
        self(row)
    }
}
