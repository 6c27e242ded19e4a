//! Batched, atomic writes under a per-commit operation cap.
//!
//! [`BatchWriter`] buffers [`MutationOp`]s and commits them in batches of at
//! most `max_batch_size`. A full buffer is committed before the next op is
//! accepted, so no batch handed to the store ever exceeds the limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::MutationOp;
use crate::error::{MigrateError, Result};
use crate::retry::RetryPolicy;
use crate::store::DocumentStore;

/// Statistics collected by a writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Number of committed batches (previewed batches in dry-run).
    pub commits: u64,

    /// Total ops in committed batches.
    pub ops_committed: u64,

    /// Commit attempts that were retried after a transient failure.
    pub retries: u64,

    /// Time spent committing.
    pub commit_time: Duration,
}

impl WriterStats {
    /// Merge another writer's stats into this one.
    pub fn merge(&mut self, other: &WriterStats) {
        self.commits += other.commits;
        self.ops_committed += other.ops_committed;
        self.retries += other.retries;
        self.commit_time += other.commit_time;
    }
}

/// Accumulates ops into commit-sized batches.
pub struct BatchWriter {
    store: Arc<dyn DocumentStore>,
    max_batch_size: usize,
    retry: RetryPolicy,
    dry_run: bool,
    buffer: Vec<MutationOp>,
    preview: Vec<Vec<MutationOp>>,
    stats: WriterStats,
}

impl BatchWriter {
    /// Create a writer committing at most `max_batch_size` ops per batch.
    ///
    /// Fails when `max_batch_size` is zero or above the store's hard cap.
    pub fn new(store: Arc<dyn DocumentStore>, max_batch_size: usize) -> Result<Self> {
        let hard_cap = store.max_batch_ops();
        if max_batch_size == 0 || max_batch_size > hard_cap {
            return Err(MigrateError::BatchInvariant {
                size: max_batch_size,
                limit: hard_cap,
            });
        }
        Ok(Self {
            store,
            max_batch_size,
            retry: RetryPolicy::default(),
            dry_run: false,
            buffer: Vec::with_capacity(max_batch_size),
            preview: Vec::new(),
            stats: WriterStats::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// In dry-run mode batches are appended to the preview log instead of committed.
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Ops buffered but not yet committed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Batches a live run would have committed, in order.
    pub fn preview(&self) -> &[Vec<MutationOp>] {
        &self.preview
    }

    pub fn into_preview(self) -> Vec<Vec<MutationOp>> {
        self.preview
    }

    /// Queue one op, committing the buffer first if it is full.
    ///
    /// An invalid op is rejected with a validation error and not buffered.
    pub async fn enqueue(&mut self, op: MutationOp) -> Result<()> {
        op.validate()?;
        if self.buffer.len() >= self.max_batch_size {
            self.flush().await?;
        }
        self.buffer.push(op);
        Ok(())
    }

    /// Queue several ops in order.
    pub async fn enqueue_all(&mut self, ops: impl IntoIterator<Item = MutationOp>) -> Result<()> {
        for op in ops {
            self.enqueue(op).await?;
        }
        Ok(())
    }

    /// Commit whatever is buffered. A no-op on an empty buffer.
    ///
    /// Transient failures retry the whole batch. On a permanent failure the
    /// batch stays buffered and the error is returned.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.buffer.len() > self.max_batch_size {
            return Err(MigrateError::BatchInvariant {
                size: self.buffer.len(),
                limit: self.max_batch_size,
            });
        }

        let size = self.buffer.len();
        if self.dry_run {
            self.preview.push(std::mem::take(&mut self.buffer));
            self.stats.commits += 1;
            self.stats.ops_committed += size as u64;
            debug!("dry-run: previewed batch #{} of {} ops", self.stats.commits, size);
            return Ok(());
        }

        let started = Instant::now();
        let store = &self.store;
        let batch = self.buffer.as_slice();
        let attempts = AtomicU64::new(0);
        let counter = &attempts;
        let outcome = self
            .retry
            .run(&format!("commit of {} ops", size), move || {
                counter.fetch_add(1, Ordering::Relaxed);
                store.commit_batch(batch)
            })
            .await;
        self.stats.retries += attempts.into_inner().saturating_sub(1);
        self.stats.commit_time += started.elapsed();
        outcome?;

        self.buffer.clear();
        self.stats.commits += 1;
        self.stats.ops_committed += size as u64;
        debug!(
            "committed batch #{} of {} ops to {} store",
            self.stats.commits,
            size,
            self.store.store_type()
        );
        Ok(())
    }
}
