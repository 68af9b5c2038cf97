//! Outcome reporting for merges and pipeline runs.

use serde::Serialize;

/// What a merge did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// No rows changed, or no column was left to update. No UPDATE ran.
    NothingToUpdate,

    /// The UPDATE ran.
    Applied {
        /// Rows the server reported as updated.
        rows_updated: u64,
        /// Requested columns that were dropped because a table lacks them.
        ignored_columns: Vec<String>,
    },
}

impl MergeOutcome {
    pub fn rows_updated(&self) -> u64 {
        match self {
            MergeOutcome::NothingToUpdate => 0,
            MergeOutcome::Applied { rows_updated, .. } => *rows_updated,
        }
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub table: String,
    /// Effective rows per fetch; 0 when the table was empty.
    pub batch_size: usize,
    pub batches: u64,
    pub rows_read: u64,
    pub rows_kept: u64,
    pub rows_staged: u64,
    pub outcome: MergeOutcome,
    pub duration_ms: u64,
}

impl PipelineReport {
    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
