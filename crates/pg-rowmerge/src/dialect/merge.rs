//! Change detection and the change-only merge UPDATE.

use tracing::warn;

use crate::core::identifier::{Ident, TableName};
use crate::core::schema::{ColumnDescriptor, TableDescriptor};
use crate::error::{Result, RowMergeError};
use crate::typemap::ColumnType;

/// Builds the "row changed" predicate between a source and a target row.
///
/// Ordinary columns are compared with `IS DISTINCT FROM`, so two NULLs are
/// equal and NULL against a value is a change. `json` has no equality
/// operator and is compared as `jsonb`. Spatial columns are compared with
/// `ST_Equals`, negated, plus an explicit NULL-presence test because
/// `ST_Equals` is not NULL-safe.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    columns: Vec<ColumnDescriptor>,
}

impl ChangeDetector {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// OR of the per-column comparisons, or `None` with nothing to compare.
    pub fn predicate(&self, source: &TableName, target: &TableName) -> Option<String> {
        if self.columns.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let s = format!("{}.{}", source.qualified(), c.name);
                let t = format!("{}.{}", target.qualified(), c.name);
                distinct_predicate(&c.column_type, &s, &t)
            })
            .collect();
        Some(parts.join(" OR "))
    }
}

/// NULL-safe "differs" test between two column references.
pub fn distinct_predicate(column_type: &ColumnType, source: &str, target: &str) -> String {
    match column_type {
        ColumnType::Geometry => format!(
            "(({s} IS NULL) IS DISTINCT FROM ({t} IS NULL) OR NOT ST_Equals({s}::geometry, {t}::geometry))",
            s = source,
            t = target
        ),
        ColumnType::Json => format!("{}::jsonb IS DISTINCT FROM {}::jsonb", source, target),
        _ => format!("{} IS DISTINCT FROM {}", source, target),
    }
}

/// A resolved merge of `source` into `target`.
#[derive(Debug, Clone)]
pub struct MergeUpdate {
    source: TableName,
    target: TableName,
    join_columns: Vec<Ident>,
    detector: ChangeDetector,
    ignored_columns: Vec<String>,
}

impl MergeUpdate {
    /// Resolve the columns of a merge.
    ///
    /// Join columns must exist on both tables. `target_columns` defaults to
    /// every column the two tables share; requested names missing from
    /// either table are dropped with a warning and reported through
    /// [`ignored_columns`](Self::ignored_columns). Join columns are never
    /// updated.
    pub fn plan(
        source: &TableDescriptor,
        target: &TableDescriptor,
        join_columns: &[Ident],
        target_columns: Option<&[Ident]>,
    ) -> Result<Self> {
        if join_columns.is_empty() {
            return Err(RowMergeError::Validation(
                "at least one join column is required".into(),
            ));
        }
        for table in [source, target] {
            let missing = table.missing_columns(join_columns);
            if !missing.is_empty() {
                return Err(RowMergeError::UnknownColumn {
                    table: table.name.display_name(),
                    columns: missing,
                });
            }
        }

        let requested: Vec<Ident> = match target_columns {
            Some(cols) => cols.to_vec(),
            None => target
                .columns
                .iter()
                .filter(|c| source.has_column(c.name.as_str()))
                .map(|c| c.name.clone())
                .collect(),
        };

        let mut ignored = Vec::new();
        let mut update = Vec::new();
        for name in requested {
            if join_columns.contains(&name) {
                continue;
            }
            match (source.column(name.as_str()), target.column(name.as_str())) {
                (Some(_), Some(col)) => {
                    if !update.iter().any(|c: &ColumnDescriptor| c.name == name) {
                        update.push(col.clone());
                    }
                }
                _ => ignored.push(name.as_str().to_string()),
            }
        }

        if !ignored.is_empty() {
            warn!(
                "{}: ignoring columns not present on both {} and {}: {}",
                target.name,
                source.name,
                target.name,
                ignored.join(", ")
            );
        }

        Ok(Self {
            source: source.name.clone(),
            target: target.name.clone(),
            join_columns: join_columns.to_vec(),
            detector: ChangeDetector::new(update),
            ignored_columns: ignored,
        })
    }

    pub fn source(&self) -> &TableName {
        &self.source
    }

    pub fn target(&self) -> &TableName {
        &self.target
    }

    pub fn join_columns(&self) -> &[Ident] {
        &self.join_columns
    }

    /// Columns that will be written.
    pub fn update_columns(&self) -> &[ColumnDescriptor] {
        self.detector.columns()
    }

    /// Requested names that were dropped.
    pub fn ignored_columns(&self) -> &[String] {
        &self.ignored_columns
    }

    /// Nothing left to update once join and unknown columns are removed.
    pub fn is_noop(&self) -> bool {
        self.detector.columns().is_empty()
    }

    /// The UPDATE statement, or `None` for a no-op merge.
    pub fn to_sql(&self) -> Option<String> {
        let changed = self.detector.predicate(&self.source, &self.target)?;
        let src = self.source.qualified();
        let tgt = self.target.qualified();

        let assignments = self
            .detector
            .columns()
            .iter()
            .map(|c| format!("{} = {}.{}", c.name, src, c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let join = self
            .join_columns
            .iter()
            .map(|k| format!("{}.{} = {}.{}", tgt, k, src, k))
            .collect::<Vec<_>>()
            .join(" AND ");

        Some(format!(
            "UPDATE {} SET {} FROM {} WHERE {} AND ({})",
            tgt, assignments, src, join, changed
        ))
    }
}
