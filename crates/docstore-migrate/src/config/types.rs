//! Configuration type definitions.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::planner::MutationPlan;
use crate::retry::RetryPolicy;
use crate::store::DEFAULT_HARD_CAP;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Document store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Batching, paging, retry and concurrency settings.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// The migration to run.
    pub plan: MutationPlan,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot backing the in-memory store. Created on first save.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Store-enforced per-commit operation limit (default: 500).
    #[serde(default = "default_hard_cap")]
    pub hard_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            hard_cap: default_hard_cap(),
        }
    }
}

/// Migration behavior configuration.
///
/// Fields left unset fall back to the `get_*` defaults; `workers` is filled
/// in by auto-tuning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Ops per committed batch; must stay below the store hard cap (default: 450).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,

    /// Documents per scan page (default: 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,

    /// Documents per page when listing children to delete (default: 200).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_page_size: Option<usize>,

    /// Concurrent collections in fan-out runs. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Attempts per page fetch, commit or delete, including the first (default: 5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Backoff before the first retry, doubled on each further one (default: 500).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,

    /// Log progress every N scanned documents (default: 1000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_interval: Option<u64>,

    /// Preview batches instead of committing them.
    #[serde(default)]
    pub dry_run: bool,
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.workers.is_none() {
            // One worker per core, within 5..=10.
            let workers = resources.cpu_cores.clamp(5, 10);
            self.workers = Some(workers);
        }
        info!(
            "Auto-tuned: workers={}, max_batch_size={}, page_size={}",
            self.get_workers(),
            self.get_max_batch_size(),
            self.get_page_size()
        );
        self
    }

    pub fn get_max_batch_size(&self) -> usize {
        self.max_batch_size.unwrap_or(450)
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size.unwrap_or(300)
    }

    pub fn get_delete_page_size(&self) -> usize {
        self.delete_page_size.unwrap_or(200)
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(5)
    }

    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(5)
    }

    pub fn get_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.unwrap_or(500))
    }

    pub fn get_progress_interval(&self) -> u64 {
        self.progress_interval.unwrap_or(1000).max(1)
    }

    /// Retry policy built from `max_retries` and `retry_base_delay_ms`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.get_max_retries(), self.get_retry_base_delay())
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("snapshot.json")
}

fn default_hard_cap() -> usize {
    DEFAULT_HARD_CAP
}
