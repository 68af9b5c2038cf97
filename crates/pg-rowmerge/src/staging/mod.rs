//! Staging table lifecycle.
//!
//! A staging table holds transformed rows until they are merged. Its name is
//! derived from the target (`tmp_<target>` in the target's schema), so two
//! concurrent runs against the same target collide; callers must serialize
//! runs per target table.
//!
//! [`StagingTable::end`] must be awaited on every exit path. A staging table
//! dropped without it (a panic or a cancelled future) logs a warning and
//! schedules a best-effort `DROP TABLE` on the current runtime.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::identifier::{truncate_identifier, TableName};
use crate::core::schema::{ColumnDescriptor, TableDescriptor};
use crate::core::traits::Database;
use crate::core::value::SqlValue;
use crate::dialect::literal::TypedLiteralCompiler;
use crate::dialect::select::build_select_into;
use crate::dialect::values::ValuesRelation;
use crate::error::{Result, RowMergeError};

/// Prefix of every staging table name.
pub const STAGING_PREFIX: &str = "tmp_";

/// Staging table name for `target`, truncated to the identifier limit the
/// same way the server would truncate it.
pub fn staging_table_name(target: &TableName) -> Result<TableName> {
    let name = format!("{}{}", STAGING_PREFIX, target.name.as_str());
    target.sibling(truncate_identifier(&name))
}

/// `DROP TABLE IF EXISTS <table>`
pub fn drop_table_sql(table: &TableName) -> String {
    format!("DROP TABLE IF EXISTS {}", table.qualified())
}

/// A disposable table owned by one run.
pub struct StagingTable<D: Database> {
    db: Arc<D>,
    name: TableName,
    columns: Vec<ColumnDescriptor>,
    compiler: TypedLiteralCompiler,
    created: bool,
    ended: bool,
    rows_staged: u64,
}

impl<D: Database> StagingTable<D> {
    /// Prepare the staging table for `target`. Nothing is created yet.
    ///
    /// `columns` fixes the column order and declared types of every row
    /// staged through this handle.
    pub fn new(
        db: Arc<D>,
        target: &TableName,
        columns: Vec<ColumnDescriptor>,
        compiler: TypedLiteralCompiler,
    ) -> Result<Self> {
        if columns.is_empty() {
            return Err(RowMergeError::Validation(
                "a staging table needs at least one column".into(),
            ));
        }
        Ok(Self {
            db,
            name: staging_table_name(target)?,
            columns,
            compiler,
            created: false,
            ended: false,
            rows_staged: 0,
        })
    }

    pub fn name(&self) -> &TableName {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Rows written through this handle.
    pub fn rows_staged(&self) -> u64 {
        self.rows_staged
    }

    /// Descriptor of the staging table, for planning the merge.
    pub fn descriptor(&self) -> TableDescriptor {
        TableDescriptor::new(self.name.clone(), self.columns.clone())
    }

    /// Create the table from literal rows.
    pub async fn begin(&mut self, rows: &[Vec<SqlValue>]) -> Result<u64> {
        self.check_open()?;
        if self.created {
            return Err(RowMergeError::Validation(format!(
                "staging table {} was already created",
                self.name
            )));
        }
        let relation = self.compile(rows)?;
        let sql = relation.select_into_sql(&self.columns, &self.name)?;
        self.create(&sql).await?;
        self.rows_staged += relation.len() as u64;
        Ok(relation.len() as u64)
    }

    /// Create the table by projecting this handle's columns from `source`.
    pub async fn begin_from_select(&mut self, source: &TableName) -> Result<u64> {
        self.check_open()?;
        if self.created {
            return Err(RowMergeError::Validation(format!(
                "staging table {} was already created",
                self.name
            )));
        }
        let columns: Vec<_> = self.columns.iter().map(|c| c.name.clone()).collect();
        let sql = build_select_into(source, &self.name, &columns);
        let copied = self.create(&sql).await?;
        self.rows_staged += copied;
        Ok(copied)
    }

    /// Insert more literal rows into the created table.
    pub async fn append(&mut self, rows: &[Vec<SqlValue>]) -> Result<u64> {
        self.check_open()?;
        if !self.created {
            return Err(RowMergeError::Validation(format!(
                "staging table {} has not been created",
                self.name
            )));
        }
        let relation = self.compile(rows)?;
        let sql = relation.insert_into_sql(&self.columns, &self.name)?;
        debug!("{}: appending {} rows", self.name, relation.len());
        self.db.execute(&sql).await?;
        self.rows_staged += relation.len() as u64;
        Ok(relation.len() as u64)
    }

    /// Create on first use, append afterwards. Empty input is a no-op.
    pub async fn stage(&mut self, rows: &[Vec<SqlValue>]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if self.created {
            self.append(rows).await
        } else {
            self.begin(rows).await
        }
    }

    /// Drop the table if it exists. Idempotent.
    pub async fn end(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        debug!("{}: dropping staging table", self.name);
        self.db.execute(&drop_table_sql(&self.name)).await?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.ended {
            return Err(RowMergeError::Validation(format!(
                "staging table {} has already been dropped",
                self.name
            )));
        }
        Ok(())
    }

    fn compile(&self, rows: &[Vec<SqlValue>]) -> Result<ValuesRelation> {
        let names: Vec<_> = self.columns.iter().map(|c| c.name.clone()).collect();
        let types: Vec<_> = self.columns.iter().map(|c| c.column_type.clone()).collect();
        ValuesRelation::compile(&self.compiler, &names, &types, rows)
    }

    async fn create(&mut self, sql: &str) -> Result<u64> {
        if self.db.table_exists(&self.name).await? {
            return Err(RowMergeError::StagingConflict {
                table: self.name.display_name(),
                message: "table already exists; it is left over from an earlier run \
                          or another run on the same target is in progress"
                    .into(),
            });
        }

        debug!("{}: creating staging table", self.name);
        match self.db.execute(sql).await {
            Ok(n) => {
                self.created = true;
                Ok(n)
            }
            Err(e) if e.is_duplicate_table() => Err(RowMergeError::StagingConflict {
                table: self.name.display_name(),
                message: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}

impl<D: Database> Drop for StagingTable<D> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        warn!(
            "{}: staging table handle dropped without cleanup; scheduling DROP TABLE",
            self.name
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let db = Arc::clone(&self.db);
            let name = self.name.clone();
            handle.spawn(async move {
                if let Err(e) = db.execute(&drop_table_sql(&name)).await {
                    warn!("{}: deferred staging cleanup failed: {}", name, e);
                }
            });
        }
    }
}
