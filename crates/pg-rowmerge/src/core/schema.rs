//! Table metadata as resolved by a [`Catalog`](super::traits::Catalog).

use crate::core::identifier::{Ident, TableName};
use crate::typemap::ColumnType;
use serde::Serialize;

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescriptor {
    pub name: Ident,

    /// Logical type driving literal rendering and change detection.
    pub column_type: ColumnType,

    /// Declared SQL type string, e.g. `numeric(10,2)`.
    pub sql_type: String,
}

impl ColumnDescriptor {
    pub fn new(name: Ident, column_type: ColumnType, sql_type: impl Into<String>) -> Self {
        Self {
            name,
            column_type,
            sql_type: sql_type.into(),
        }
    }
}

/// A resolved table: name plus ordered column metadata.
///
/// A descriptor only exists for a table the catalog found, so holding one
/// means the table existed when it was resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDescriptor {
    pub name: TableName,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn new(name: TableName, columns: Vec<ColumnDescriptor>) -> Self {
        Self { name, columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name.as_str() == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Names from `names` that are not columns of this table, in input order.
    pub fn missing_columns<'a, I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a Ident>,
    {
        names
            .into_iter()
            .filter(|n| !self.has_column(n.as_str()))
            .map(|n| n.as_str().to_string())
            .collect()
    }

    /// Column descriptors for `names`, in the order given.
    ///
    /// Fails with `UnknownColumn` listing every name that is absent.
    pub fn select_columns(&self, names: &[Ident]) -> crate::Result<Vec<ColumnDescriptor>> {
        let missing = self.missing_columns(names);
        if !missing.is_empty() {
            return Err(crate::RowMergeError::UnknownColumn {
                table: self.name.display_name(),
                columns: missing,
            });
        }
        Ok(names
            .iter()
            .filter_map(|n| self.column(n.as_str()).cloned())
            .collect())
    }

    pub fn column_names(&self) -> Vec<Ident> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}
