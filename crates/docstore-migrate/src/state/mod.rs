//! File-based state management for resume capability.
//!
//! The orchestrator checkpoints one [`CollectionState`] per scanned
//! collection: the cursor after the last page whose writes were flushed, and
//! the counters accumulated so far. `resume` restarts every unfinished
//! collection after its cursor.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{MigrateError, Result};
use crate::store::Cursor;

type HmacSha256 = Hmac<Sha256>;

/// Migration state for resume capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// Current run status.
    pub status: RunStatus,

    /// Per-collection state, keyed by collection path.
    pub collections: BTreeMap<String, CollectionState>,

    /// When the migration completed (if finished).
    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 over the serialized state (without this field), keyed by
    /// `config_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-collection state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionState {
    /// Task status.
    pub status: TaskStatus,

    /// Cursor after the last checkpointed page.
    pub cursor: Option<Cursor>,

    /// Documents scanned so far.
    pub scanned: u64,

    /// Documents updated so far.
    pub updated: u64,

    /// Documents left unchanged so far.
    pub skipped: u64,

    /// Documents that failed so far.
    pub errors: u64,

    /// When the collection finished.
    pub completed_at: Option<DateTime<Utc>>,

    /// Error message if failed.
    pub error: Option<String>,
}

/// Task status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl MigrationState {
    /// Create a new migration state.
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            collections: BTreeMap::new(),
            completed_at: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load state from a file, verifying its signature.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        match &state.hmac {
            Some(stored) => {
                if stored != &state.compute_hmac()? {
                    return Err(MigrateError::State(
                        "State file integrity check failed: HMAC mismatch".to_string(),
                    ));
                }
            }
            None => {
                return Err(MigrateError::State(
                    "State file has no HMAC signature".to_string(),
                ));
            }
        }

        Ok(state)
    }

    /// Save state to a file (signed, atomic write).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    /// Get or create collection state.
    pub fn collection_mut(&mut self, collection: &str) -> &mut CollectionState {
        self.collections.entry(collection.to_string()).or_default()
    }

    pub fn is_collection_completed(&self, collection: &str) -> bool {
        self.collections
            .get(collection)
            .map(|c| c.status == TaskStatus::Completed)
            .unwrap_or(false)
    }

    /// Cursor to resume `collection` after, if one was checkpointed.
    pub fn resume_cursor(&self, collection: &str) -> Option<Cursor> {
        self.collections
            .get(collection)
            .filter(|c| c.status != TaskStatus::Completed)
            .and_then(|c| c.cursor.clone())
    }

    /// Mark the run as finished with `status`.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

impl CollectionState {
    pub fn mark_in_progress(&mut self) {
        self.status = TaskStatus::InProgress;
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
    }

    /// Record a page boundary.
    pub fn checkpoint(&mut self, cursor: Option<Cursor>, scanned: u64, updated: u64, skipped: u64, errors: u64) {
        self.cursor = cursor;
        self.scanned = scanned;
        self.updated = updated;
        self.skipped = skipped;
        self.errors = errors;
    }
}
