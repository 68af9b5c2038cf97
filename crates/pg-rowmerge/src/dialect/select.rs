//! SELECT builders for streaming reads and table-to-table copies.

use crate::core::identifier::{Ident, TableName};
use crate::core::schema::ColumnDescriptor;
use crate::dialect::values::column_list;

/// Projection list for a streaming read.
///
/// Columns without native decoding (geometry, unmapped types) are read as
/// text under their own name, so their text form is what the transform sees
/// and what gets staged again.
pub fn read_projection(columns: &[ColumnDescriptor]) -> String {
    columns
        .iter()
        .map(|c| {
            if c.column_type.read_as_text() {
                format!("{}::text AS {}", c.name, c.name)
            } else {
                c.name.quoted()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `SELECT <projection> FROM <table>` for a streaming cursor.
pub fn build_cursor_select(table: &TableName, columns: &[ColumnDescriptor]) -> String {
    format!("SELECT {} FROM {}", read_projection(columns), table.qualified())
}

/// `SELECT cols INTO <into> FROM <source>`.
pub fn build_select_into(source: &TableName, into: &TableName, columns: &[Ident]) -> String {
    format!(
        "SELECT {} INTO {} FROM {}",
        column_list(columns),
        into.qualified(),
        source.qualified()
    )
}

/// `INSERT INTO <into> (cols) SELECT cols FROM <source>`.
///
/// With join columns, source rows whose key already exists in `into` are
/// skipped through an anti-join.
pub fn build_insert_from(
    source: &TableName,
    into: &TableName,
    columns: &[Ident],
    join_columns: &[Ident],
) -> String {
    let src = source.qualified();
    let dst = into.qualified();
    let projection = columns
        .iter()
        .map(|c| format!("{}.{}", src, c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        dst,
        column_list(columns),
        projection,
        src
    );

    if let Some(first) = join_columns.first() {
        let on = join_columns
            .iter()
            .map(|k| format!("{}.{} = {}.{}", src, k, dst, k))
            .collect::<Vec<_>>()
            .join(" AND ");
        sql.push_str(&format!(
            " LEFT OUTER JOIN {} ON {} WHERE {}.{} IS NULL",
            dst, on, dst, first
        ));
    }

    sql
}
