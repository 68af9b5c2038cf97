//! Core abstractions shared by the literal compiler, staging and pipeline:
//!
//! - [`identifier`]: validated identifiers and qualified table names
//! - [`schema`]: table and column metadata
//! - [`value`]: row and value representation
//! - [`traits`]: catalog, session, cursor, type mapper and transform traits

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use identifier::{Ident, TableName};
pub use schema::{ColumnDescriptor, TableDescriptor};
pub use traits::{Catalog, Database, RowCursor, RowTransform, Session, TypeMapper};
pub use value::{Batch, Row, RowUpdate, SqlValue};
