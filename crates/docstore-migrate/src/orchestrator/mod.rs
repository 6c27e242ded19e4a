//! Migration orchestrator - main workflow coordinator.
//!
//! A run scans one collection, or, for fan-out plans, the named subcollection
//! of every document in the plan's collection. Each collection is a
//! [`CollectionJob`]; jobs run on a worker pool bounded by a semaphore, each
//! with its own writer. Their outcomes are merged into a single
//! [`MigrationResult`].

mod job;
mod phase;

pub use job::{Checkpointer, CollectionJob, JobContext, JobOutcome};
pub use phase::{PhaseTracker, RunPhase};
pub use crate::progress::MigrationResult;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::{CollectionPath, MutationOp};
use crate::error::{MigrateError, Result};
use crate::planner::{DeclarativePlanner, MutationPlanner};
use crate::progress::{ProgressReporter, RunInfo};
use crate::source::DocumentSource;
use crate::state::{MigrationState, RunStatus};
use crate::store::DocumentStore;
use crate::writer::WriterStats;

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    store: Arc<dyn DocumentStore>,
    planner: Arc<dyn MutationPlanner>,
    state_file: Option<PathBuf>,
    state: Option<MigrationState>,
}

/// A finished run: the result plus, in dry-run mode, the previewed batches.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub result: MigrationResult,
    /// Batches in commit order, per collection in job order. Empty for live runs.
    pub preview: Vec<Vec<MutationOp>>,
}

impl Orchestrator {
    /// Create an orchestrator running the config's declarative plan.
    pub fn new(config: Config, store: Arc<dyn DocumentStore>) -> Result<Self> {
        let planner = Arc::new(DeclarativePlanner::new(config.plan.clone())?);
        Self::with_planner(config, store, planner)
    }

    /// Create an orchestrator with a custom planner. The config's plan still
    /// names the collection, filter and fan-out to scan.
    pub fn with_planner(
        config: Config,
        store: Arc<dyn DocumentStore>,
        planner: Arc<dyn MutationPlanner>,
    ) -> Result<Self> {
        config.validate()?;
        let max_batch_size = config.migration.get_max_batch_size();
        if max_batch_size > store.max_batch_ops() {
            return Err(MigrateError::BatchInvariant {
                size: max_batch_size,
                limit: store.max_batch_ops(),
            });
        }
        Ok(Self {
            config,
            store,
            planner,
            state_file: None,
            state: None,
        })
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Load existing state for resume.
    pub fn resume(mut self) -> Result<Self> {
        if let Some(ref path) = self.state_file {
            if path.exists() {
                let state = MigrationState::load(path)?;
                state.validate_config(&self.config.hash())?;
                info!("Resuming run {} from state file: {:?}", state.run_id, path);
                self.state = Some(state);
            } else {
                warn!("State file {:?} not found, starting a fresh run", path);
            }
        }
        Ok(self)
    }

    /// Run the migration.
    pub async fn run(self, cancel: CancellationToken) -> Result<MigrationResult> {
        Ok(self.run_detailed(cancel).await?.result)
    }

    /// Run the migration and keep the dry-run preview.
    ///
    /// A run that fails after starting still returns `Ok`, with status
    /// `failed` and `fatal_error` set. `Err` is reserved for errors before any
    /// document is touched.
    pub async fn run_detailed(mut self, cancel: CancellationToken) -> Result<RunOutput> {
        let started_at = Utc::now();
        let run_id = self
            .state
            .as_ref()
            .map(|s| s.run_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let plan = &self.config.plan;
        let migration = &self.config.migration;
        let dry_run = migration.dry_run;

        info!(
            "Starting migration '{}' (run {}) on {} store{}",
            self.planner.name(),
            run_id,
            self.store.store_type(),
            if dry_run { ", dry run" } else { "" }
        );

        let checkpointer = match (&self.state_file, dry_run) {
            (Some(path), false) => {
                let state = self
                    .state
                    .take()
                    .unwrap_or_else(|| MigrationState::new(run_id.clone(), self.config.hash()));
                Some(Arc::new(Checkpointer::new(path.clone(), state)))
            }
            (Some(_), true) => {
                info!("Dry run: state file is not written");
                None
            }
            (None, _) => None,
        };
        let resume_state = match &checkpointer {
            Some(c) => Some(c.snapshot().await),
            None => None,
        };

        let ctx = Arc::new(JobContext {
            store: self.store.clone(),
            planner: self.planner.clone(),
            filter: plan.filter.clone(),
            max_batch_size: migration.get_max_batch_size(),
            page_size: migration.get_page_size(),
            delete_page_size: migration.get_delete_page_size(),
            retry: migration.retry_policy(),
            dry_run,
            progress_interval: migration.get_progress_interval(),
            checkpointer: checkpointer.clone(),
        });

        // Cancelled by the caller, or by the first job that fails.
        let run_cancel = cancel.child_token();
        let mut pool = WorkerPool::new(migration.get_workers(), ctx.clone(), run_cancel.clone());
        let mut carried = ProgressReporter::new();

        let dispatch = match &plan.fan_out_subcollection {
            None => {
                pool.submit(job_for(plan.collection.clone(), resume_state.as_ref(), &mut carried))
                    .await;
                Ok(())
            }
            Some(sub) => {
                info!(
                    "Fan-out over {}/*/{} with {} workers",
                    plan.collection,
                    sub,
                    migration.get_workers()
                );
                self.dispatch_fan_out(&mut pool, sub, resume_state.as_ref(), &mut carried, &run_cancel)
                    .await
            }
        };

        if let Err(e) = &dispatch {
            error!("Listing parents of {} failed: {}", plan.collection, e);
            run_cancel.cancel();
        }
        let outcomes = pool.join().await;

        let mut reporter = carried;
        let mut writer_stats = WriterStats::default();
        let mut documents_deleted = 0;
        let mut preview = Vec::new();
        let mut fatal_error = dispatch.err();
        let mut any_cancelled = false;
        for outcome in outcomes {
            reporter.merge(outcome.reporter);
            writer_stats.merge(&outcome.writer_stats);
            documents_deleted += outcome.documents_deleted;
            preview.extend(outcome.preview);
            any_cancelled |= outcome.status == RunStatus::Cancelled;
            if fatal_error.is_none() {
                fatal_error = outcome.fatal_error;
            }
        }

        let status = if fatal_error.is_some() {
            RunStatus::Failed
        } else if any_cancelled || cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        if let Some(checkpointer) = &checkpointer {
            if let Err(e) = checkpointer.finish(status).await {
                warn!("Could not save final state: {}", e);
            }
        }

        let result = reporter.summary(RunInfo {
            run_id,
            migration: self.planner.name().to_string(),
            status,
            dry_run,
            commits: writer_stats.commits,
            ops_committed: writer_stats.ops_committed,
            documents_deleted,
            started_at,
            fatal_error: fatal_error.as_ref().map(|e| e.to_string()),
        });

        match &fatal_error {
            Some(e) => error!("{} - {}", result.summary_line(), e),
            None => info!("{}", result.summary_line()),
        }
        if writer_stats.retries > 0 {
            info!("{} commit retries", writer_stats.retries);
        }

        Ok(RunOutput { result, preview })
    }

    /// Page through the parent collection and submit one job per parent.
    async fn dispatch_fan_out(
        &self,
        pool: &mut WorkerPool,
        subcollection: &str,
        resume_state: Option<&MigrationState>,
        carried: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let migration = &self.config.migration;
        let mut parents = DocumentSource::scan(
            self.store.clone(),
            self.config.plan.collection.clone(),
            migration.get_page_size(),
        )
        .with_retry(migration.retry_policy());

        while let Some(page) = parents.next_page().await? {
            for parent in page {
                if cancel.is_cancelled() {
                    info!("Cancellation requested, stopping new collection jobs");
                    return Ok(());
                }
                let collection = parent.path().subcollection(subcollection)?;
                pool.submit(job_for(collection, resume_state, carried)).await;
            }
        }
        Ok(())
    }
}

/// Build the job for `collection`, honouring resume state.
///
/// Collections completed in an earlier run are not rescanned; their counters
/// go straight into `carried`.
fn job_for(
    collection: CollectionPath,
    resume_state: Option<&MigrationState>,
    carried: &mut ProgressReporter,
) -> Option<CollectionJob> {
    let mut job = CollectionJob::new(collection);
    let Some(entry) = resume_state.and_then(|s| s.collections.get(job.collection.as_str())) else {
        return Some(job);
    };
    let counters = ProgressReporter::resumed(entry.scanned, entry.updated, entry.skipped, entry.errors);
    if resume_state.is_some_and(|s| s.is_collection_completed(job.collection.as_str())) {
        info!("{}: already completed, skipping", job.collection);
        carried.merge(counters);
        return None;
    }
    job.resume_cursor = resume_state.and_then(|s| s.resume_cursor(job.collection.as_str()));
    job.resumed = counters;
    Some(job)
}

/// Semaphore-bounded pool of collection jobs.
struct WorkerPool {
    semaphore: Arc<Semaphore>,
    ctx: Arc<JobContext>,
    cancel: CancellationToken,
    handles: Vec<(CollectionPath, JoinHandle<JobOutcome>)>,
}

impl WorkerPool {
    fn new(workers: usize, ctx: Arc<JobContext>, cancel: CancellationToken) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            ctx,
            cancel,
            handles: Vec::new(),
        }
    }

    /// Wait for a free worker, then spawn `job`.
    async fn submit(&mut self, job: Option<CollectionJob>) {
        let Some(job) = job else {
            return;
        };
        // The semaphore is never closed, so acquiring cannot fail.
        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let collection = job.collection.clone();
        let handle = tokio::spawn(async move {
            let outcome = job.execute(ctx, cancel.clone()).await;
            if outcome.fatal_error.is_some() {
                cancel.cancel();
            }
            drop(permit);
            outcome
        });
        self.handles.push((collection, handle));
    }

    async fn join(self) -> Vec<JobOutcome> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for (collection, handle) in self.handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!("{}: task panicked - {}", collection, e);
                    outcomes.push(JobOutcome {
                        collection,
                        status: RunStatus::Failed,
                        reporter: ProgressReporter::new(),
                        writer_stats: WriterStats::default(),
                        documents_deleted: 0,
                        preview: Vec::new(),
                        fatal_error: Some(MigrateError::State(format!("Task panicked: {}", e))),
                    });
                }
            }
        }
        outcomes
    }
}
