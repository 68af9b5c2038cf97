//! SQL generation for PostgreSQL.
//!
//! Identifiers always come from [`Ident`](crate::core::Ident); values only
//! reach SQL text through the typed literal compiler.

pub mod literal;
pub mod merge;
pub mod select;
pub mod values;

pub use literal::{escape_sql_string, quote_literal, TypedLiteralCompiler};
pub use merge::{ChangeDetector, MergeUpdate};
pub use values::{compile_values_relation, ValuesRelation};
