//! # pg-rowmerge
//!
//! Batched row transformation and change-only merge for PostgreSQL tables.
//!
//! A pipeline run streams a table through a server-side cursor, applies a
//! caller-supplied transform to every row, stages the rows the transform
//! changed into a disposable `tmp_<table>` table, and merges them back with a
//! single `UPDATE ... FROM` that only touches rows whose values actually
//! differ. The staging table is dropped on every exit path.
//!
//! Supporting pieces:
//!
//! - **Typed literal compiler** rendering heterogeneous values as a
//!   `(VALUES ...)` relation, typed by the declared column types
//! - **Change-only merge** between any two tables sharing key columns
//! - **Table copies** (`SELECT ... INTO`, `INSERT ... SELECT` with key anti-join)
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_rowmerge::{DatabaseConfig, Orchestrator, Row, RowUpdate, SqlValue};
//!
//! #[tokio::main]
//! async fn main() -> pg_rowmerge::Result<()> {
//!     let config = DatabaseConfig::load("database.yaml")?;
//!     let orchestrator = Orchestrator::connect(&config).await?;
//!
//!     let report = orchestrator
//!         .batched_transform_merge(
//!             "orders",
//!             &["id"],
//!             Some(&["status"]),
//!             |row: &Row| match row.get("status").and_then(SqlValue::as_str) {
//!                 Some("shipped") => row.replace("status", "delivered"),
//!                 _ => Ok(RowUpdate::Keep),
//!             },
//!             Some(10_000),
//!         )
//!         .await?;
//!     println!("Updated {} rows", report.outcome.rows_updated());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod dialect;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod staging;
pub mod typemap;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use crate::config::{DatabaseConfig, LiteralFormats};
pub use crate::core::{
    Batch, Catalog, ColumnDescriptor, Database, Ident, Row, RowCursor, RowTransform, RowUpdate,
    Session, SqlValue, TableDescriptor, TableName, TypeMapper,
};
pub use crate::dialect::{ChangeDetector, MergeUpdate, TypedLiteralCompiler, ValuesRelation};
pub use crate::drivers::{HealthCheckResult, PgDatabase};
pub use crate::error::{Result, RowMergeError};
pub use crate::orchestrator::Orchestrator;
pub use crate::pipeline::{BatchedRowPipeline, MergeOutcome, PipelineReport, ALL_ROWS};
pub use crate::staging::{staging_table_name, StagingTable, STAGING_PREFIX};
pub use crate::typemap::{ColumnType, PgTypeMapper};
