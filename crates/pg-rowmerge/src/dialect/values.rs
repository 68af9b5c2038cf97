//! Literal VALUES relations and the statements that consume them.

use crate::core::identifier::{validate_type_name, Ident, TableName};
use crate::core::schema::ColumnDescriptor;
use crate::core::value::SqlValue;
use crate::dialect::literal::{check_arity, TypedLiteralCompiler};
use crate::error::{Result, RowMergeError};
use crate::typemap::ColumnType;

/// Quoted alias of every compiled VALUES relation.
pub const VALUES_ALIAS: &str = "\"values\"";

/// A compiled `(VALUES ...) AS "values" (cols)` relation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuesRelation {
    columns: Vec<Ident>,
    types: Vec<ColumnType>,
    tuples: Vec<String>,
}

impl ValuesRelation {
    /// Compile literal rows into a relation.
    ///
    /// Every length is checked before any value is rendered. At least one
    /// row is required since `VALUES` cannot be empty.
    pub fn compile<R>(
        compiler: &TypedLiteralCompiler,
        columns: &[Ident],
        types: &[ColumnType],
        rows: &[R],
    ) -> Result<Self>
    where
        R: AsRef<[SqlValue]>,
    {
        check_arity("column types", columns.len(), types.len())?;
        for row in rows {
            check_arity("value row", columns.len(), row.as_ref().len())?;
        }
        if columns.is_empty() {
            return Err(RowMergeError::Validation(
                "a VALUES relation needs at least one column".into(),
            ));
        }
        if rows.is_empty() {
            return Err(RowMergeError::Validation(
                "a VALUES relation needs at least one row".into(),
            ));
        }

        let tuples = rows
            .iter()
            .map(|row| compiler.render_tuple(columns, types, row.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            columns: columns.to_vec(),
            types: types.to_vec(),
            tuples,
        })
    }

    pub fn columns(&self) -> &[Ident] {
        &self.columns
    }

    pub fn types(&self) -> &[ColumnType] {
        &self.types
    }

    /// Number of rows in the relation.
    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// SQL fragment usable wherever a FROM item is allowed.
    pub fn to_sql(&self) -> String {
        format!(
            "(VALUES {}) AS {} ({})",
            self.tuples.join(", "),
            VALUES_ALIAS,
            column_list(&self.columns)
        )
    }

    /// `SELECT <casts> INTO <into> FROM <relation>`.
    ///
    /// `targets` gives the declared SQL type of each column, so the created
    /// table matches the table the rows are headed for.
    pub fn select_into_sql(&self, targets: &[ColumnDescriptor], into: &TableName) -> Result<String> {
        Ok(format!(
            "SELECT {} INTO {} FROM {}",
            self.cast_projection(targets)?,
            into.qualified(),
            self.to_sql()
        ))
    }

    /// `INSERT INTO <into> (cols) SELECT <casts> FROM <relation>`.
    pub fn insert_into_sql(&self, targets: &[ColumnDescriptor], into: &TableName) -> Result<String> {
        Ok(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            into.qualified(),
            column_list(&self.columns),
            self.cast_projection(targets)?,
            self.to_sql()
        ))
    }

    fn cast_projection(&self, targets: &[ColumnDescriptor]) -> Result<String> {
        check_arity("column types", self.columns.len(), targets.len())?;
        self.columns
            .iter()
            .zip(targets)
            .map(|(col, target)| {
                if col != &target.name {
                    return Err(RowMergeError::Validation(format!(
                        "VALUES column {} does not line up with target column {}",
                        col, target.name
                    )));
                }
                validate_type_name(&target.sql_type)?;
                Ok(format!("{}.{}::{} AS {}", VALUES_ALIAS, col, target.sql_type, col))
            })
            .collect::<Result<Vec<_>>>()
            .map(|parts| parts.join(", "))
    }
}

/// Compile literal rows into a VALUES relation fragment.
pub fn compile_values_relation<R>(
    compiler: &TypedLiteralCompiler,
    column_names: &[&str],
    column_types: &[ColumnType],
    rows: &[R],
) -> Result<String>
where
    R: AsRef<[SqlValue]>,
{
    let columns = crate::core::identifier::idents(column_names)?;
    Ok(ValuesRelation::compile(compiler, &columns, column_types, rows)?.to_sql())
}

/// `"a", "b", "c"`
pub fn column_list(columns: &[Ident]) -> String {
    columns
        .iter()
        .map(Ident::quoted)
        .collect::<Vec<_>>()
        .join(", ")
}
