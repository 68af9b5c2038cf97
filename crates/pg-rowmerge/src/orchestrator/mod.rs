//! Operation surface: table names in, resolved descriptors inside.
//!
//! Table names are parsed once here (unqualified names fall back to the
//! configured schema) and resolved through the [`Catalog`] before any
//! statement is built.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, LiteralFormats};
use crate::core::identifier::{idents, validate_type_name, Ident, TableName};
use crate::core::schema::{ColumnDescriptor, TableDescriptor};
use crate::core::traits::{Database, RowTransform};
use crate::core::value::SqlValue;
use crate::dialect::literal::{check_arity, TypedLiteralCompiler};
use crate::dialect::merge::MergeUpdate;
use crate::dialect::select::{build_insert_from, build_select_into};
use crate::dialect::values::{compile_values_relation, ValuesRelation};
use crate::drivers::postgres::PgDatabase;
use crate::error::{Result, RowMergeError};
use crate::pipeline::{BatchedRowPipeline, MergeOutcome, PipelineReport, ALL_ROWS};
use crate::staging::{drop_table_sql, staging_table_name};
use crate::typemap::map_type_name;

/// Declared type used for caller-created columns without an explicit type.
const DEFAULT_COLUMN_TYPE: &str = "text";

/// Entry point for every table operation.
pub struct Orchestrator<D: Database = PgDatabase> {
    db: Arc<D>,
    compiler: TypedLiteralCompiler,
    default_schema: String,
}

impl Orchestrator<PgDatabase> {
    /// Connect using `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let db = PgDatabase::connect(config).await?;
        Ok(Self::with_database(
            Arc::new(db),
            config.literal_formats(),
            &config.schema,
        ))
    }
}

impl<D: Database> Orchestrator<D> {
    /// Wrap an already connected database.
    pub fn with_database(db: Arc<D>, formats: LiteralFormats, default_schema: &str) -> Self {
        Self {
            db,
            compiler: TypedLiteralCompiler::new(formats),
            default_schema: default_schema.to_string(),
        }
    }

    pub fn database(&self) -> &Arc<D> {
        &self.db
    }

    pub fn compiler(&self) -> &TypedLiteralCompiler {
        &self.compiler
    }

    /// Parse `table` or `schema.table`.
    pub fn table(&self, name: &str) -> Result<TableName> {
        TableName::parse(name, &self.default_schema)
    }

    /// Resolve a table, failing if it does not exist.
    pub async fn describe(&self, name: &str) -> Result<TableDescriptor> {
        let table = self.table(name)?;
        self.resolve(&table).await
    }

    async fn resolve(&self, table: &TableName) -> Result<TableDescriptor> {
        self.db
            .describe_table(table)
            .await?
            .ok_or_else(|| RowMergeError::NoSuchTable(table.display_name()))
    }

    /// A pipeline builder for `target`.
    pub fn pipeline(&self, target: &str) -> Result<BatchedRowPipeline<D>> {
        Ok(BatchedRowPipeline::new(
            Arc::clone(&self.db),
            self.compiler.clone(),
            self.table(target)?,
        ))
    }

    /// Stream `target`, transform every row and merge the changed ones back.
    ///
    /// `target_columns` defaults to every non-join column and `batch_size`
    /// to the whole table.
    pub async fn batched_transform_merge<T>(
        &self,
        target: &str,
        join_columns: &[&str],
        target_columns: Option<&[&str]>,
        transform: T,
        batch_size: Option<i64>,
    ) -> Result<PipelineReport>
    where
        T: RowTransform + 'static,
    {
        let mut pipeline = self
            .pipeline(target)?
            .with_join_columns(join_columns.iter().copied())
            .with_transform(transform)
            .with_batch_size(batch_size.unwrap_or(ALL_ROWS));
        if let Some(cols) = target_columns {
            pipeline = pipeline.with_target_columns(cols.iter().copied());
        }
        pipeline.run().await
    }

    /// Write literal rows into `table`.
    ///
    /// An existing table takes its column types from the catalog. A missing
    /// table is created from `column_types` (default `text`) when
    /// `create_if_missing` is set. Returns the number of rows written.
    pub async fn stage_literal_rows<R>(
        &self,
        table: &str,
        rows: &[R],
        column_names: &[&str],
        column_types: Option<&[&str]>,
        create_if_missing: bool,
    ) -> Result<u64>
    where
        R: AsRef<[SqlValue]>,
    {
        let table = self.table(table)?;
        let names = idents(column_names)?;
        if let Some(types) = column_types {
            check_arity("column types", names.len(), types.len())?;
        }
        for row in rows {
            check_arity("value row", names.len(), row.as_ref().len())?;
        }
        if rows.is_empty() {
            info!("{}: no values to insert", table);
            return Ok(0);
        }

        let (columns, exists) = match self.db.describe_table(&table).await? {
            Some(existing) => (existing.select_columns(&names)?, true),
            None if create_if_missing => (declared_columns(&names, column_types)?, false),
            None => return Err(RowMergeError::NoSuchTable(table.display_name())),
        };

        let types: Vec<_> = columns.iter().map(|c| c.column_type.clone()).collect();
        let relation = ValuesRelation::compile(&self.compiler, &names, &types, rows)?;
        let sql = if exists {
            relation.insert_into_sql(&columns, &table)?
        } else {
            info!("{}: creating table from {} literal rows", table, relation.len());
            relation.select_into_sql(&columns, &table)?
        };

        debug!("{}: {}", table, sql);
        let written = self.db.execute(&sql).await?;
        info!("{}: wrote {} rows", table, written);
        Ok(written)
    }

    /// Update `target` from `source`, writing only rows whose tracked
    /// columns differ.
    ///
    /// Requested target columns absent from either table are ignored and
    /// reported in the outcome.
    pub async fn merge_tables(
        &self,
        source: &str,
        target: &str,
        join_columns: &[&str],
        target_columns: Option<&[&str]>,
    ) -> Result<MergeOutcome> {
        let source = self.resolve(&self.table(source)?).await?;
        let target = self.resolve(&self.table(target)?).await?;
        let join = idents(join_columns)?;
        let requested = target_columns.map(idents).transpose()?;

        let plan = MergeUpdate::plan(&source, &target, &join, requested.as_deref())?;
        let sql = match plan.to_sql() {
            Some(sql) => sql,
            None => {
                info!("{}: no columns to update", target.name);
                return Ok(MergeOutcome::NothingToUpdate);
            }
        };

        debug!("{}: merging with {}", target.name, sql);
        let rows_updated =
            self.db
                .execute(&sql)
                .await
                .map_err(|e| RowMergeError::MergeFailure {
                    table: target.name.display_name(),
                    message: e.to_string(),
                })?;
        info!(
            "{}: updated {} rows from {}",
            target.name, rows_updated, source.name
        );

        Ok(MergeOutcome::Applied {
            rows_updated,
            ignored_columns: plan.ignored_columns().to_vec(),
        })
    }

    /// Render literal rows as a `(VALUES ...) AS "values" (...)` fragment.
    ///
    /// `column_types` are logical or declared type names (`numeric(10,2)`,
    /// `jsonb`, `unicode`).
    pub fn compile_values_relation<R>(
        &self,
        column_names: &[&str],
        column_types: &[&str],
        rows: &[R],
    ) -> Result<String>
    where
        R: AsRef<[SqlValue]>,
    {
        let types: Vec<_> = column_types.iter().map(|t| map_type_name(t)).collect();
        compile_values_relation(&self.compiler, column_names, &types, rows)
    }

    /// Create `into` as a copy of `source`'s columns.
    ///
    /// Requested columns that `source` lacks are dropped with a warning.
    /// Returns the number of rows copied.
    pub async fn select_from(
        &self,
        source: &str,
        into: &str,
        columns: Option<&[&str]>,
    ) -> Result<u64> {
        let source = self.resolve(&self.table(source)?).await?;
        let into = self.table(into)?;
        if self.db.table_exists(&into).await? {
            return Err(RowMergeError::TableExists(into.display_name()));
        }

        let columns = match self.available_columns(&source, columns)? {
            Some(columns) => columns,
            None => return Ok(0),
        };

        let sql = build_select_into(&source.name, &into, &columns);
        debug!("{}: {}", into, sql);
        let copied = self.db.execute(&sql).await?;
        info!("{}: created from {} ({} rows)", into, source.name, copied);
        Ok(copied)
    }

    /// Append `source` rows to `into`.
    ///
    /// With `join_columns`, rows whose key already exists in `into` are
    /// skipped. A missing `into` is created through [`select_from`](Self::select_from)
    /// when `create_if_missing` is set. Returns the number of rows written.
    pub async fn insert_from(
        &self,
        source: &str,
        into: &str,
        columns: Option<&[&str]>,
        join_columns: Option<&[&str]>,
        create_if_missing: bool,
    ) -> Result<u64> {
        let into_name = self.table(into)?;
        let into_table = match self.db.describe_table(&into_name).await? {
            Some(table) => table,
            None if create_if_missing => {
                info!("{}: does not exist, creating it from {}", into_name, source);
                return self.select_from(source, into, columns).await;
            }
            None => return Err(RowMergeError::NoSuchTable(into_name.display_name())),
        };
        let source = self.resolve(&self.table(source)?).await?;

        let join = idents(join_columns.unwrap_or_default())?;
        for table in [&source, &into_table] {
            let missing = table.missing_columns(&join);
            if !missing.is_empty() {
                return Err(RowMergeError::UnknownColumn {
                    table: table.name.display_name(),
                    columns: missing,
                });
            }
        }

        let mut columns = match self.available_columns(&source, columns)? {
            Some(columns) => columns,
            None => return Ok(0),
        };
        let absent: Vec<String> = into_table.missing_columns(&columns);
        if !absent.is_empty() {
            warn!(
                "{}: ignoring columns it does not have: {}",
                into_table.name,
                absent.join(", ")
            );
            columns.retain(|c| into_table.has_column(c.as_str()));
        }
        if columns.is_empty() {
            warn!("{}: no columns in common with {}", into_table.name, source.name);
            return Ok(0);
        }

        let sql = build_insert_from(&source.name, &into_table.name, &columns, &join);
        debug!("{}: {}", into_table.name, sql);
        let inserted = self.db.execute(&sql).await?;
        info!(
            "{}: inserted {} rows from {}",
            into_table.name, inserted, source.name
        );
        Ok(inserted)
    }

    /// Drop `table` if it exists. Returns whether it existed.
    pub async fn drop_table(&self, table: &str) -> Result<bool> {
        let table = self.table(table)?;
        self.drop_table_name(&table).await
    }

    /// Drop the staging table left for `target` by an interrupted run.
    pub async fn cleanup_staging(&self, target: &str) -> Result<bool> {
        let staging = staging_table_name(&self.table(target)?)?;
        self.drop_table_name(&staging).await
    }

    async fn drop_table_name(&self, table: &TableName) -> Result<bool> {
        let existed = self.db.table_exists(table).await?;
        if !existed {
            warn!("{}: does not exist, nothing to drop", table);
        }
        self.db.execute(&drop_table_sql(table)).await?;
        if existed {
            info!("{}: dropped", table);
        }
        Ok(existed)
    }

    /// Requested columns present on `table` (all columns by default).
    /// `None` when nothing is left.
    fn available_columns(
        &self,
        table: &TableDescriptor,
        requested: Option<&[&str]>,
    ) -> Result<Option<Vec<Ident>>> {
        let mut columns = match requested {
            Some(names) => idents(names)?,
            None => table.column_names(),
        };
        let missing = table.missing_columns(&columns);
        if !missing.is_empty() {
            warn!(
                "{}: ignoring columns it does not have: {}",
                table.name,
                missing.join(", ")
            );
            columns.retain(|c| table.has_column(c.as_str()));
        }
        if columns.is_empty() {
            warn!("{}: no columns to copy", table.name);
            return Ok(None);
        }
        Ok(Some(columns))
    }
}

fn declared_columns(names: &[Ident], types: Option<&[&str]>) -> Result<Vec<ColumnDescriptor>> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let sql_type = types
                .and_then(|t| t.get(i).copied())
                .unwrap_or(DEFAULT_COLUMN_TYPE)
                .trim();
            validate_type_name(sql_type)?;
            Ok(ColumnDescriptor::new(
                name.clone(),
                map_type_name(sql_type),
                sql_type,
            ))
        })
        .collect()
}
