//! Collection job: one sequential scan-plan-write pass over a collection.
//!
//! A job owns its [`BatchWriter`] and [`ProgressReporter`]. Jobs share only
//! the store, the planner and (when resuming is enabled) the checkpointer,
//! so several of them can run on a worker pool.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::phase::{PhaseTracker, RunPhase};
use crate::core::{CollectionPath, Document, MutationOp};
use crate::deleter::{DeleteSink, RecursiveDeleter};
use crate::error::{MigrateError, Result};
use crate::planner::MutationPlanner;
use crate::progress::{Outcome, ProgressReporter};
use crate::retry::RetryPolicy;
use crate::source::DocumentSource;
use crate::state::{MigrationState, RunStatus};
use crate::store::{Cursor, DocumentStore, EqualityFilter};
use crate::writer::{BatchWriter, WriterStats};

/// Settings shared by every job of a run.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn DocumentStore>,
    pub planner: Arc<dyn MutationPlanner>,
    pub filter: Option<EqualityFilter>,
    pub max_batch_size: usize,
    pub page_size: usize,
    pub delete_page_size: usize,
    pub retry: RetryPolicy,
    pub dry_run: bool,
    pub progress_interval: u64,
    pub checkpointer: Option<Arc<Checkpointer>>,
}

/// Shared, signed resume state written at page boundaries.
pub struct Checkpointer {
    path: PathBuf,
    state: Mutex<MigrationState>,
}

impl Checkpointer {
    pub fn new(path: PathBuf, state: MigrationState) -> Self {
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> MigrationState {
        self.state.lock().await.clone()
    }

    async fn update<F: FnOnce(&mut MigrationState)>(&self, f: F) -> Result<()> {
        let mut state = self.state.lock().await;
        f(&mut state);
        state.save(&self.path)
    }

    pub async fn start_collection(&self, collection: &CollectionPath) -> Result<()> {
        self.update(|state| state.collection_mut(collection.as_str()).mark_in_progress())
            .await
    }

    pub async fn checkpoint(
        &self,
        collection: &CollectionPath,
        cursor: Option<&Cursor>,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        self.update(|state| {
            state.collection_mut(collection.as_str()).checkpoint(
                cursor.cloned(),
                reporter.scanned(),
                reporter.updated(),
                reporter.skipped(),
                reporter.errors(),
            )
        })
        .await
    }

    pub async fn finish_collection(
        &self,
        collection: &CollectionPath,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.update(|state| {
            let entry = state.collection_mut(collection.as_str());
            match status {
                RunStatus::Completed => entry.mark_completed(),
                RunStatus::Failed => entry.mark_failed(error.unwrap_or("unknown error")),
                RunStatus::Running | RunStatus::Cancelled => {}
            }
        })
        .await
    }

    pub async fn finish(&self, status: RunStatus) -> Result<()> {
        self.update(|state| state.finish(status)).await
    }
}

/// Work unit for one collection (Command pattern).
#[derive(Debug, Clone)]
pub struct CollectionJob {
    /// Collection to scan.
    pub collection: CollectionPath,

    /// Continue after this cursor instead of from the start.
    pub resume_cursor: Option<Cursor>,

    /// Counters carried over from a previous run.
    pub resumed: ProgressReporter,
}

impl CollectionJob {
    pub fn new(collection: CollectionPath) -> Self {
        Self {
            collection,
            resume_cursor: None,
            resumed: ProgressReporter::new(),
        }
    }
}

/// Everything a finished job reports back.
pub struct JobOutcome {
    pub collection: CollectionPath,
    pub status: RunStatus,
    pub reporter: ProgressReporter,
    pub writer_stats: WriterStats,
    pub documents_deleted: u64,
    pub preview: Vec<Vec<MutationOp>>,
    pub fatal_error: Option<MigrateError>,
}

impl CollectionJob {
    /// Run the job to completion, failure or cancellation.
    ///
    /// Never returns an error: a fatal error is carried in
    /// [`JobOutcome::fatal_error`] alongside the partial counts.
    pub async fn execute(self, ctx: Arc<JobContext>, cancel: CancellationToken) -> JobOutcome {
        let collection = self.collection.clone();
        let mut run = JobRun {
            phase: PhaseTracker::new(collection.as_str()),
            reporter: self.resumed.clone(),
            documents_deleted: 0,
            cancelled: false,
        };

        let writer = BatchWriter::new(ctx.store.clone(), ctx.max_batch_size).map(|w| {
            w.with_retry(ctx.retry.clone()).dry_run(ctx.dry_run)
        });
        let mut writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                return JobOutcome {
                    collection,
                    status: RunStatus::Failed,
                    reporter: run.reporter,
                    writer_stats: WriterStats::default(),
                    documents_deleted: 0,
                    preview: Vec::new(),
                    fatal_error: Some(e),
                }
            }
        };

        let result = run.scan(&self, &ctx, &mut writer, &cancel).await;
        let (status, fatal_error) = match result {
            Ok(()) if run.cancelled => (RunStatus::Cancelled, None),
            Ok(()) => (RunStatus::Completed, None),
            Err(e) => {
                // Reaching Failed is always legal from a live phase.
                let _ = run.phase.advance(RunPhase::Failed);
                error!("{}: failed - {}", collection, e);
                (RunStatus::Failed, Some(e))
            }
        };

        if let Some(checkpointer) = &ctx.checkpointer {
            let message = fatal_error.as_ref().map(|e| e.to_string());
            if let Err(e) = checkpointer
                .finish_collection(&collection, status, message.as_deref())
                .await
            {
                warn!("{}: could not save state: {}", collection, e);
            }
        }

        info!(
            "{}: {} (scanned {}, updated {}, skipped {}, errors {})",
            collection,
            status,
            run.reporter.scanned(),
            run.reporter.updated(),
            run.reporter.skipped(),
            run.reporter.errors()
        );

        let writer_stats = writer.stats().clone();
        JobOutcome {
            collection,
            status,
            reporter: run.reporter,
            writer_stats,
            documents_deleted: run.documents_deleted,
            preview: writer.into_preview(),
            fatal_error,
        }
    }
}

struct JobRun {
    phase: PhaseTracker,
    reporter: ProgressReporter,
    documents_deleted: u64,
    cancelled: bool,
}

impl JobRun {
    async fn scan(
        &mut self,
        job: &CollectionJob,
        ctx: &JobContext,
        writer: &mut BatchWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.phase.advance(RunPhase::Scanning)?;
        if let Some(checkpointer) = &ctx.checkpointer {
            checkpointer.start_collection(&job.collection).await?;
        }
        if let Some(cursor) = &job.resume_cursor {
            info!("{}: resuming after cursor {}", job.collection, cursor);
        }

        let deleter = RecursiveDeleter::new(ctx.store.clone())
            .with_page_size(ctx.delete_page_size)
            .with_retry(ctx.retry.clone());
        let mut source = DocumentSource::scan(ctx.store.clone(), job.collection.clone(), ctx.page_size)
            .with_filter(ctx.filter.clone())
            .with_retry(ctx.retry.clone())
            .starting_after(job.resume_cursor.clone());

        'pages: while !cancel.is_cancelled() {
            let page = match source.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    if let Err(flush_err) = writer.flush().await {
                        warn!("{}: could not flush pending batch: {}", job.collection, flush_err);
                    }
                    return Err(e);
                }
            };

            for doc in page {
                if cancel.is_cancelled() {
                    break 'pages;
                }
                self.process(doc, ctx, writer, &deleter, cancel).await?;
            }

            if let Some(checkpointer) = &ctx.checkpointer {
                writer.flush().await?;
                checkpointer
                    .checkpoint(&job.collection, source.cursor(), &self.reporter)
                    .await?;
                debug!("{}: checkpointed after page {}", job.collection, source.pages_fetched());
            }
        }

        self.cancelled = cancel.is_cancelled();
        self.phase.advance(RunPhase::Flushing)?;
        writer.flush().await?;
        if self.cancelled {
            info!(
                "{}: cancellation requested, pending batch flushed",
                job.collection
            );
            self.phase.advance(RunPhase::Cancelled)
        } else {
            self.phase.advance(RunPhase::Done)
        }
    }

    /// Plan and queue one document. Only run-fatal errors are returned.
    async fn process(
        &mut self,
        doc: Document,
        ctx: &JobContext,
        writer: &mut BatchWriter,
        deleter: &RecursiveDeleter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.phase.advance(RunPhase::Planning)?;
        let outcome = match ctx.planner.plan(&doc) {
            Ok(ops) if ops.is_empty() => Outcome::Skipped,
            Ok(ops) => {
                self.phase.advance(RunPhase::Writing)?;
                match self.write(ops, writer, deleter, cancel).await {
                    Ok(true) => Outcome::Updated,
                    Ok(false) => {
                        info!("{}: cancelled during recursive delete", doc.path());
                        return self.phase.advance(RunPhase::Scanning);
                    }
                    Err(e) if e.is_document_scoped() => Outcome::Error {
                        path: doc.path().clone(),
                        message: e.to_string(),
                    },
                    Err(e) => return Err(e),
                }
            }
            Err(e) if e.is_document_scoped() => Outcome::Error {
                path: doc.path().clone(),
                message: e.to_string(),
            },
            Err(e) => return Err(e),
        };

        if let Outcome::Error { path, message } = &outcome {
            warn!("{}: {}", path, message);
        }
        self.reporter.record(outcome);
        self.phase.advance(RunPhase::Scanning)?;

        if self.reporter.scanned() % ctx.progress_interval == 0 {
            info!(
                "{}: {} scanned, {} updated, {} skipped, {} errors",
                doc.path().collection(),
                self.reporter.scanned(),
                self.reporter.updated(),
                self.reporter.skipped(),
                self.reporter.errors()
            );
        }
        Ok(())
    }

    /// Queue a document's ops. Returns `false` if cancellation cut a
    /// recursive delete short, in which case the document is left unrecorded.
    async fn write(
        &mut self,
        ops: Vec<MutationOp>,
        writer: &mut BatchWriter,
        deleter: &RecursiveDeleter,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        // Nothing is queued for a document unless all of its ops are valid.
        ops.iter().try_for_each(MutationOp::validate)?;

        for op in ops {
            match op {
                MutationOp::DeleteDocument {
                    path,
                    recursive: true,
                } => {
                    let report = deleter
                        .delete_tree(&path, DeleteSink::Batched(&mut *writer), cancel)
                        .await?;
                    self.documents_deleted += report.documents_deleted;
                    if report.cancelled {
                        return Ok(false);
                    }
                }
                MutationOp::DeleteDocument { .. } => {
                    writer.enqueue(op).await?;
                    self.documents_deleted += 1;
                }
                op => writer.enqueue(op).await?,
            }
        }
        Ok(true)
    }
}
