//! Per-document outcome accounting and the run summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::DocumentPath;
use crate::error::Result;
use crate::state::RunStatus;

/// What happened to one scanned document.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Ops were queued for the document.
    Updated,
    /// The planner produced no ops.
    Skipped,
    /// Planning or queuing failed for this document only.
    Error { path: DocumentPath, message: String },
}

/// A per-document failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub path: String,
    pub message: String,
}

/// Additive counters for one worker.
///
/// Every recorded outcome increments `scanned` and exactly one of the other
/// three counters, so `updated + skipped + errors == scanned` always holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressReporter {
    scanned: u64,
    updated: u64,
    skipped: u64,
    errors: u64,
    error_details: Vec<ErrorDetail>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from counters restored from a checkpoint.
    pub fn resumed(scanned: u64, updated: u64, skipped: u64, errors: u64) -> Self {
        Self {
            scanned,
            updated,
            skipped,
            errors,
            error_details: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: Outcome) {
        self.scanned += 1;
        match outcome {
            Outcome::Updated => self.updated += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Error { path, message } => {
                self.errors += 1;
                self.error_details.push(ErrorDetail {
                    path: path.to_string(),
                    message,
                });
            }
        }
    }

    /// Fold another reporter into this one.
    pub fn merge(&mut self, other: ProgressReporter) {
        self.scanned += other.scanned;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.error_details.extend(other.error_details);
    }

    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    pub fn updated(&self) -> u64 {
        self.updated
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn error_details(&self) -> &[ErrorDetail] {
        &self.error_details
    }

    /// Build the run summary from these counters.
    pub fn summary(&self, run: RunInfo) -> MigrationResult {
        let completed_at = Utc::now();
        MigrationResult {
            run_id: run.run_id,
            migration: run.migration,
            status: run.status,
            dry_run: run.dry_run,
            scanned: self.scanned,
            updated: self.updated,
            skipped: self.skipped,
            errors: self.errors,
            error_details: self.error_details.clone(),
            commits: run.commits,
            ops_committed: run.ops_committed,
            documents_deleted: run.documents_deleted,
            elapsed_ms: (completed_at - run.started_at).num_milliseconds().max(0) as u64,
            started_at: run.started_at,
            completed_at,
            fatal_error: run.fatal_error,
        }
    }
}

/// Run-level facts the reporter does not track itself.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: String,
    pub migration: String,
    pub status: RunStatus,
    pub dry_run: bool,
    pub commits: u64,
    pub ops_committed: u64,
    pub documents_deleted: u64,
    pub started_at: DateTime<Utc>,
    pub fatal_error: Option<String>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Name of the migration plan.
    pub migration: String,

    /// Final status.
    pub status: RunStatus,

    /// Whether writes were previewed instead of committed.
    pub dry_run: bool,

    /// Documents read.
    pub scanned: u64,

    /// Documents with at least one queued op.
    pub updated: u64,

    /// Documents needing no change.
    pub skipped: u64,

    /// Documents that failed individually.
    pub errors: u64,

    /// One entry per failed document.
    pub error_details: Vec<ErrorDetail>,

    /// Batches committed (or previewed).
    pub commits: u64,

    /// Ops in those batches.
    pub ops_committed: u64,

    /// Documents removed by recursive deletes.
    pub documents_deleted: u64,

    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// The error that stopped the run, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// One-line human-readable summary.
    pub fn summary_line(&self) -> String {
        format!(
            "Migration '{}' {}: scanned {}, updated {}, skipped {}, errors {} in {:.1}s ({} commits{})",
            self.migration,
            self.status,
            self.scanned,
            self.updated,
            self.skipped,
            self.errors,
            self.elapsed_ms as f64 / 1000.0,
            self.commits,
            if self.dry_run { ", dry run" } else { "" }
        )
    }
}
