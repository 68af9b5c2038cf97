//! Batched row transformation and change-only merge.
//!
//! A run moves through these steps, with cleanup reachable from any of them:
//!
//! 1. **Validate** the transform, batch size and columns before any row I/O.
//! 2. **Stream** `join columns ++ target columns` through one server-side
//!    cursor, `batch_size` rows per fetch, in cursor order.
//! 3. **Transform** each row; rows the transform keeps are not staged.
//! 4. **Stage** each batch's replacements: the first non-empty batch creates
//!    the staging table, later ones append to it.
//! 5. **Merge** once, from the staging table into the target, writing only
//!    rows that differ on at least one target column.
//! 6. **Clean up** by dropping the staging table, on success and failure.
//!
//! Batches are processed strictly one after another; the next fetch is not
//! issued until the previous batch is staged, so memory stays proportional
//! to the batch size.

mod report;

pub use report::{MergeOutcome, PipelineReport};

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::core::identifier::{Ident, TableName};
use crate::core::schema::{ColumnDescriptor, TableDescriptor};
use crate::core::traits::{Database, RowCursor, RowTransform};
use crate::core::value::{RowUpdate, SqlValue};
use crate::dialect::literal::TypedLiteralCompiler;
use crate::dialect::merge::MergeUpdate;
use crate::dialect::select::build_cursor_select;
use crate::error::{Result, RowMergeError};
use crate::staging::StagingTable;

/// Batch size meaning "the whole table in one fetch".
pub const ALL_ROWS: i64 = -1;

/// Builder and runner for one transform-and-merge pass over a table.
pub struct BatchedRowPipeline<D: Database> {
    db: Arc<D>,
    compiler: TypedLiteralCompiler,
    target: TableName,
    join_columns: Vec<String>,
    target_columns: Option<Vec<String>>,
    transform: Option<Box<dyn RowTransform>>,
    batch_size: i64,
}

#[derive(Debug, Default)]
struct StreamStats {
    batches: u64,
    rows_read: u64,
    rows_kept: u64,
}

impl<D: Database> BatchedRowPipeline<D> {
    pub fn new(db: Arc<D>, compiler: TypedLiteralCompiler, target: TableName) -> Self {
        Self {
            db,
            compiler,
            target,
            join_columns: Vec::new(),
            target_columns: None,
            transform: None,
            batch_size: ALL_ROWS,
        }
    }

    /// Columns identifying a row. Never updated.
    pub fn with_join_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Columns the transform may change. Defaults to every non-join column.
    pub fn with_target_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_transform<T: RowTransform + 'static>(mut self, transform: T) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    /// Rows per fetch. Negative selects the whole table; zero is rejected.
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run the pipeline.
    pub async fn run(mut self) -> Result<PipelineReport> {
        let started = Instant::now();

        let mut transform = self.transform.take().ok_or_else(|| {
            RowMergeError::InvalidTransform("no row transform was supplied".into())
        })?;
        if self.batch_size == 0 {
            return Err(RowMergeError::InvalidBatchSize(self.batch_size));
        }

        let table = self
            .db
            .describe_table(&self.target)
            .await?
            .ok_or_else(|| RowMergeError::NoSuchTable(self.target.display_name()))?;
        let (join, update) = self.resolve_columns(&table)?;

        let mut report = PipelineReport {
            table: self.target.display_name(),
            batch_size: 0,
            batches: 0,
            rows_read: 0,
            rows_kept: 0,
            rows_staged: 0,
            outcome: MergeOutcome::NothingToUpdate,
            duration_ms: 0,
        };

        if update.is_empty() {
            info!("{}: no non-key columns to update", self.target);
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        let row_count = self.db.row_count(&self.target).await?;
        if row_count == 0 {
            info!("{}: no rows to update", self.target);
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        let batch_size = if self.batch_size < 0 {
            row_count as usize
        } else {
            self.batch_size as usize
        };
        report.batch_size = batch_size;

        let mut columns: Vec<ColumnDescriptor> = join.clone();
        columns.extend(update.iter().cloned());

        let mut staging = StagingTable::new(
            Arc::clone(&self.db),
            &self.target,
            columns.clone(),
            self.compiler.clone(),
        )?;

        let result = self
            .stream_and_merge(
                &table,
                &columns,
                &join,
                &update,
                batch_size,
                transform.as_mut(),
                &mut staging,
                &mut report,
            )
            .await;
        let cleanup = staging.end().await;

        match (result, cleanup) {
            (Ok(()), Ok(())) => {}
            (Ok(()), Err(e)) => return Err(e),
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(cleanup_err)) => {
                warn!(
                    "{}: staging cleanup failed after an earlier error: {}",
                    self.target, cleanup_err
                );
                return Err(e);
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Validate identifiers and columns; returns (join, update) descriptors.
    fn resolve_columns(
        &self,
        table: &TableDescriptor,
    ) -> Result<(Vec<ColumnDescriptor>, Vec<ColumnDescriptor>)> {
        if self.join_columns.is_empty() {
            return Err(RowMergeError::Validation(
                "at least one join column is required".into(),
            ));
        }
        let join_idents = crate::core::identifier::idents(&self.join_columns)?;
        let target_idents = match &self.target_columns {
            Some(cols) => crate::core::identifier::idents(cols)?,
            None => table
                .column_names()
                .into_iter()
                .filter(|c| !join_idents.contains(c))
                .collect(),
        };

        let mut missing = table.missing_columns(&join_idents);
        for name in table.missing_columns(&target_idents) {
            if !missing.contains(&name) {
                missing.push(name);
            }
        }
        if !missing.is_empty() {
            return Err(RowMergeError::UnknownColumn {
                table: table.name.display_name(),
                columns: missing,
            });
        }

        let overlap: Vec<&str> = target_idents
            .iter()
            .filter(|c| join_idents.contains(c))
            .map(Ident::as_str)
            .collect();
        if !overlap.is_empty() {
            warn!(
                "{}: join columns are never updated, ignoring them as target columns: {}",
                self.target,
                overlap.join(", ")
            );
        }

        let mut update_idents: Vec<Ident> = Vec::new();
        for c in target_idents {
            if !join_idents.contains(&c) && !update_idents.contains(&c) {
                update_idents.push(c);
            }
        }
        let mut join_unique: Vec<Ident> = Vec::new();
        for c in join_idents {
            if !join_unique.contains(&c) {
                join_unique.push(c);
            }
        }

        Ok((
            table.select_columns(&join_unique)?,
            table.select_columns(&update_idents)?,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_and_merge(
        &self,
        table: &TableDescriptor,
        columns: &[ColumnDescriptor],
        join: &[ColumnDescriptor],
        update: &[ColumnDescriptor],
        batch_size: usize,
        transform: &mut dyn RowTransform,
        staging: &mut StagingTable<D>,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let select = build_cursor_select(&self.target, columns);
        debug!("{}: streaming with {}", self.target, select);

        let mut cursor = self.db.open_cursor(&select).await?;
        let streamed = self
            .stream(cursor.as_mut(), columns.len(), batch_size, transform, staging)
            .await;
        let closed = cursor.close().await;
        let stats = streamed?;
        closed?;

        report.batches = stats.batches;
        report.rows_read = stats.rows_read;
        report.rows_kept = stats.rows_kept;
        report.rows_staged = staging.rows_staged();

        if !staging.is_created() {
            info!("{}: no rows to update", self.target);
            return Ok(());
        }

        if report.rows_staged == stats.rows_read {
            info!(
                "{}: applying changes to all {} rows",
                self.target, stats.rows_read
            );
        } else {
            info!(
                "{}: applying changes to only {} of {} rows",
                self.target, report.rows_staged, stats.rows_read
            );
        }

        let join_names: Vec<Ident> = join.iter().map(|c| c.name.clone()).collect();
        let update_names: Vec<Ident> = update.iter().map(|c| c.name.clone()).collect();
        let plan = MergeUpdate::plan(
            &staging.descriptor(),
            table,
            &join_names,
            Some(&update_names),
        )?;
        let sql = match plan.to_sql() {
            Some(sql) => sql,
            None => return Ok(()),
        };

        debug!("{}: merging with {}", self.target, sql);
        let rows_updated = self.db.execute(&sql).await.map_err(|e| {
            RowMergeError::MergeFailure {
                table: self.target.display_name(),
                message: e.to_string(),
            }
        })?;
        info!("{}: updated {} rows", self.target, rows_updated);

        report.outcome = MergeOutcome::Applied {
            rows_updated,
            ignored_columns: plan.ignored_columns().to_vec(),
        };
        Ok(())
    }

    async fn stream(
        &self,
        cursor: &mut dyn RowCursor,
        width: usize,
        batch_size: usize,
        transform: &mut dyn RowTransform,
        staging: &mut StagingTable<D>,
    ) -> Result<StreamStats> {
        let mut stats = StreamStats::default();

        loop {
            let batch = cursor.fetch(batch_size).await?;
            let is_last = batch.is_last || batch.is_empty();
            if batch.is_empty() {
                break;
            }
            stats.batches += 1;

            let mut changed: Vec<Vec<SqlValue>> = Vec::new();
            for row in &batch.rows {
                stats.rows_read += 1;
                match transform.apply(row)? {
                    RowUpdate::Keep => stats.rows_kept += 1,
                    RowUpdate::Replace(values) => {
                        if values.len() != width {
                            return Err(RowMergeError::ArityMismatch {
                                context: format!("transform result for {}", self.target),
                                expected: width,
                                actual: values.len(),
                            });
                        }
                        changed.push(values);
                    }
                }
            }

            debug!(
                "{}: batch {} read {} rows, staging {}",
                self.target,
                stats.batches,
                batch.len(),
                changed.len()
            );
            staging.stage(&changed).await?;

            if is_last {
                break;
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Row;
    use crate::testing::MockDatabase;

    const ORDERS: &str = "public.orders";
    const STAGING: &str = "public.tmp_orders";

    fn seed(db: &MockDatabase, rows: usize) {
        db.add_table(
            ORDERS,
            &[
                ("pk", "integer"),
                ("amount", "numeric(10,2)"),
                ("note", "text"),
            ],
            (1..=rows as i64)
                .map(|i| {
                    vec![
                        SqlValue::I64(i),
                        SqlValue::F64(i as f64 * 10.0),
                        SqlValue::Text(format!("order {}", i)),
                    ]
                })
                .collect(),
        );
    }

    fn pipeline(db: &Arc<MockDatabase>) -> BatchedRowPipeline<MockDatabase> {
        BatchedRowPipeline::new(
            Arc::clone(db),
            TypedLiteralCompiler::default(),
            TableName::new("public", "orders").unwrap(),
        )
        .with_join_columns(["pk"])
        .with_target_columns(["amount"])
    }

    fn double_pk_1(row: &Row) -> Result<RowUpdate> {
        if row.get("pk") == Some(&SqlValue::I64(1)) {
            let amount = row.get("amount").and_then(SqlValue::as_f64).unwrap_or(0.0);
            row.replace("amount", amount * 2.0)
        } else {
            Ok(RowUpdate::Keep)
        }
    }

    // ===== scenarios =====

    #[tokio::test]
    async fn test_single_row_changed() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 3);
        let before = db.rows(ORDERS);

        let report = pipeline(&db)
            .with_transform(double_pk_1)
            .run()
            .await
            .unwrap();

        let after = db.rows(ORDERS);
        let differing: Vec<_> = before
            .iter()
            .zip(&after)
            .filter(|(b, a)| b != a)
            .collect();
        assert_eq!(differing.len(), 1);
        assert_eq!(after[0][1], SqlValue::F64(20.0));
        assert_eq!(after[0][2], before[0][2]);

        assert_eq!(report.rows_read, 3);
        assert_eq!(report.rows_kept, 2);
        assert_eq!(report.rows_staged, 1);
        assert_eq!(report.outcome.rows_updated(), 1);
        assert!(!db.has_table(STAGING));
    }

    #[tokio::test]
    async fn test_target_name_at_identifier_limit() {
        let table = "a".repeat(61);
        let key = format!("public.{}", table);
        let db = Arc::new(MockDatabase::new());
        db.add_table(
            &key,
            &[("pk", "integer"), ("amount", "numeric(10,2)")],
            vec![
                vec![SqlValue::I64(1), SqlValue::F64(10.0)],
                vec![SqlValue::I64(2), SqlValue::F64(20.0)],
            ],
        );

        let report = BatchedRowPipeline::new(
            Arc::clone(&db),
            TypedLiteralCompiler::default(),
            TableName::new("public", &table).unwrap(),
        )
        .with_join_columns(["pk"])
        .with_target_columns(["amount"])
        .with_transform(double_pk_1)
        .run()
        .await
        .unwrap();

        assert_eq!(report.outcome.rows_updated(), 1);
        assert_eq!(db.rows(&key)[0][1], SqlValue::F64(20.0));
        let staging = format!("public.tmp_{}", "a".repeat(59));
        assert!(db
            .statements()
            .iter()
            .any(|s| s.contains(&format!("\"tmp_{}\"", "a".repeat(59)))));
        assert!(!db.has_table(&staging));
    }

    #[tokio::test]
    async fn test_empty_table_short_circuits() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 0);

        let report = pipeline(&db)
            .with_transform(double_pk_1)
            .run()
            .await
            .unwrap();

        assert_eq!(report.outcome, MergeOutcome::NothingToUpdate);
        assert_eq!(db.cursors_opened(), 0);
        assert!(db.statements().is_empty());
        assert!(!db.has_table(STAGING));
    }

    #[tokio::test]
    async fn test_transform_error_cleans_up() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 3);
        let before = db.rows(ORDERS);

        let mut seen = 0;
        let err = pipeline(&db)
            .with_batch_size(1)
            .with_transform(move |row: &Row| {
                seen += 1;
                if seen == 2 {
                    return Err(RowMergeError::transform("bad row"));
                }
                row.replace("amount", 0.0)
            })
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, RowMergeError::Transform(_)));
        // the first batch was staged before the failure
        assert!(db
            .statements()
            .iter()
            .any(|s| s.starts_with("SELECT \"values\"")));
        assert!(!db.has_table(STAGING));
        assert_eq!(db.rows(ORDERS), before);
        assert_eq!(db.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_unknown_target_column_rejected_before_io() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 3);

        let err = BatchedRowPipeline::new(
            Arc::clone(&db),
            TypedLiteralCompiler::default(),
            TableName::new("public", "orders").unwrap(),
        )
        .with_join_columns(["pk"])
        .with_target_columns(["amount", "colour"])
        .with_transform(double_pk_1)
        .run()
        .await
        .unwrap_err();

        assert!(
            matches!(err, RowMergeError::UnknownColumn { ref columns, .. } if columns == &["colour"])
        );
        assert!(db.statements().is_empty());
    }

    // ===== batching =====

    async fn run_with_batch(batch_size: i64) -> (Vec<Vec<SqlValue>>, Vec<usize>) {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 5);
        pipeline(&db)
            .with_batch_size(batch_size)
            .with_transform(|row: &Row| {
                let pk = row.get("pk").and_then(SqlValue::as_i64).unwrap_or(0);
                if pk % 2 == 1 {
                    row.replace("amount", pk as f64)
                } else {
                    Ok(RowUpdate::Keep)
                }
            })
            .run()
            .await
            .unwrap();
        (db.rows(ORDERS), db.fetch_sizes())
    }

    #[tokio::test]
    async fn test_batch_size_independence() {
        let (one, one_fetches) = run_with_batch(1).await;
        let (exact, _) = run_with_batch(5).await;
        let (all, all_fetches) = run_with_batch(ALL_ROWS).await;

        assert_eq!(one, exact);
        assert_eq!(one, all);
        // five single-row batches then an empty fetch
        assert_eq!(one_fetches, vec![1; 6]);
        // "all" resolves to the row count
        assert_eq!(all_fetches[0], 5);
    }

    #[tokio::test]
    async fn test_short_last_batch_ends_stream() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 5);
        let report = pipeline(&db)
            .with_batch_size(2)
            .with_transform(|row: &Row| row.replace("amount", 1.0))
            .run()
            .await
            .unwrap();
        assert_eq!(db.fetch_sizes(), vec![2, 2, 2]);
        assert_eq!(report.batches, 3);
        assert_eq!(report.rows_staged, 5);
        assert_eq!(report.outcome.rows_updated(), 5);
    }

    #[tokio::test]
    async fn test_all_rows_kept_reports_nothing() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 4);
        let report = pipeline(&db)
            .with_batch_size(3)
            .with_transform(|_: &Row| Ok(RowUpdate::Keep))
            .run()
            .await
            .unwrap();
        assert_eq!(report.outcome, MergeOutcome::NothingToUpdate);
        assert_eq!(report.rows_kept, 4);
        assert!(!db.statements().iter().any(|s| s.starts_with("UPDATE")));
        assert!(!db.has_table(STAGING));
    }

    #[tokio::test]
    async fn test_unchanged_replacement_not_counted_as_update() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 2);
        let report = pipeline(&db)
            .with_transform(|row: &Row| Ok(RowUpdate::Replace(row.values().to_vec())))
            .run()
            .await
            .unwrap();
        assert_eq!(report.rows_staged, 2);
        assert_eq!(report.outcome.rows_updated(), 0);
    }

    // ===== validation =====

    #[tokio::test]
    async fn test_missing_transform() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 1);
        let err = pipeline(&db).run().await.unwrap_err();
        assert!(matches!(err, RowMergeError::InvalidTransform(_)));
    }

    #[tokio::test]
    async fn test_zero_batch_size() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 1);
        let err = pipeline(&db)
            .with_batch_size(0)
            .with_transform(double_pk_1)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, RowMergeError::InvalidBatchSize(0)));
    }

    #[tokio::test]
    async fn test_missing_table() {
        let db = Arc::new(MockDatabase::new());
        let err = pipeline(&db)
            .with_transform(double_pk_1)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, RowMergeError::NoSuchTable(_)));
    }

    #[tokio::test]
    async fn test_wrong_width_replacement() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 2);
        let err = pipeline(&db)
            .with_transform(|_: &Row| Ok(RowUpdate::Replace(vec![SqlValue::I64(1)])))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RowMergeError::ArityMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
        assert!(!db.has_table(STAGING));
    }

    #[tokio::test]
    async fn test_join_columns_dropped_from_targets() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 2);
        pipeline(&db)
            .with_target_columns(["pk", "amount"])
            .with_transform(|row: &Row| row.replace("amount", 3.0))
            .run()
            .await
            .unwrap();
        let update = db
            .statements()
            .into_iter()
            .find(|s| s.starts_with("UPDATE"))
            .unwrap();
        assert!(update.contains("SET \"amount\" = "));
        assert!(!update.contains("SET \"pk\""));
    }

    #[tokio::test]
    async fn test_default_targets_are_non_join_columns() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 1);
        BatchedRowPipeline::new(
            Arc::clone(&db),
            TypedLiteralCompiler::default(),
            TableName::new("public", "orders").unwrap(),
        )
        .with_join_columns(["pk"])
        .with_transform(|row: &Row| row.replace("note", "it's done"))
        .run()
        .await
        .unwrap();
        assert_eq!(db.rows(ORDERS)[0][2], SqlValue::Text("it's done".into()));
    }

    // ===== failures =====

    #[tokio::test]
    async fn test_merge_failure_cleans_up() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 3);
        db.fail_on("UPDATE");
        let before = db.rows(ORDERS);

        let err = pipeline(&db)
            .with_transform(double_pk_1)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, RowMergeError::MergeFailure { .. }));
        assert!(!db.has_table(STAGING));
        assert_eq!(db.rows(ORDERS), before);
    }

    #[tokio::test]
    async fn test_staging_conflict_surfaces_and_clears_orphan() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 3);
        db.add_table(STAGING, &[("pk", "integer")], vec![]);

        let err = pipeline(&db)
            .with_transform(double_pk_1)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, RowMergeError::StagingConflict { .. }));
        assert!(!db.has_table(STAGING));
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let db = Arc::new(MockDatabase::new());
        seed(&db, 3);
        let report = pipeline(&db)
            .with_transform(double_pk_1)
            .run()
            .await
            .unwrap();
        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"applied\""));
        assert!(json.contains("\"rows_updated\": 1"));
    }
}
