//! Recursive deletion of document subtrees.
//!
//! Deleting a document in the store leaves its subcollections behind. The
//! [`RecursiveDeleter`] walks a subtree depth-first with an explicit stack and
//! deletes every descendant before the document that owns it.
//!
//! The stack holds three kinds of work:
//!
//! - `Expand(doc)`: discover the subcollections of `doc`, then schedule its delete
//!   underneath them.
//! - `Collection { path, cursor }`: fetch one page of `path`, schedule the rest of
//!   the collection, then expand every child of the page.
//! - `Delete(doc)`: remove `doc` itself.
//!
//! Because the stack is LIFO, a document's `Delete` runs only after every task
//! pushed above it (its subcollections, page by page) is done. At most one page
//! of children is held per open collection level.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::{CollectionPath, DocumentPath, MutationOp};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::store::{Cursor, DocumentStore};
use crate::writer::BatchWriter;

/// Default page size used when listing children to delete.
pub const DEFAULT_DELETE_PAGE_SIZE: usize = 200;

/// Where document deletes go.
pub enum DeleteSink<'a> {
    /// One retried `delete_document` call per document.
    Direct,
    /// `DeleteDocument` ops queued on a writer, sharing its batches.
    Batched(&'a mut BatchWriter),
    /// Walk and count, delete nothing.
    Preview,
}

/// Outcome of one or more subtree deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    /// Delete operations issued (or counted, in preview), the roots included.
    pub documents_deleted: u64,

    /// Subcollections visited.
    pub collections_visited: u64,

    /// Whether the walk stopped early because of cancellation.
    pub cancelled: bool,
}

impl DeleteReport {
    pub fn merge(&mut self, other: &DeleteReport) {
        self.documents_deleted += other.documents_deleted;
        self.collections_visited += other.collections_visited;
        self.cancelled |= other.cancelled;
    }
}

enum Task {
    Expand(DocumentPath),
    Collection {
        path: CollectionPath,
        cursor: Option<Cursor>,
    },
    Delete(DocumentPath),
}

/// Depth-first subtree deleter.
pub struct RecursiveDeleter {
    store: Arc<dyn DocumentStore>,
    page_size: usize,
    retry: RetryPolicy,
}

impl RecursiveDeleter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            page_size: DEFAULT_DELETE_PAGE_SIZE,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Delete `root` and everything below it.
    ///
    /// Idempotent: deleting a tree that is already gone succeeds and still
    /// counts the root. Cancellation is checked between stack items; a
    /// cancelled walk returns its partial report with `cancelled` set.
    pub async fn delete_tree(
        &self,
        root: &DocumentPath,
        mut sink: DeleteSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeleteReport> {
        let mut report = DeleteReport::default();
        let mut stack = vec![Task::Expand(root.clone())];

        while let Some(task) = stack.pop() {
            if cancel.is_cancelled() {
                info!("delete of {} cancelled with {} tasks pending", root, stack.len() + 1);
                report.cancelled = true;
                break;
            }

            match task {
                Task::Expand(doc) => {
                    let subcollections = self
                        .retry
                        .run(&format!("listing subcollections of {}", doc), || {
                            self.store.list_subcollections(&doc)
                        })
                        .await?;
                    stack.push(Task::Delete(doc));
                    for path in subcollections.into_iter().rev() {
                        stack.push(Task::Collection { path, cursor: None });
                    }
                }
                Task::Collection { path, cursor } => {
                    if cursor.is_none() {
                        report.collections_visited += 1;
                    }
                    let page = self
                        .retry
                        .run(&format!("listing {} for delete", path), || {
                            self.store
                                .list_collection(&path, cursor.as_ref(), self.page_size, None)
                        })
                        .await?;
                    debug!("{}: {} children to delete", path, page.documents.len());

                    if let Some(next) = page.next_cursor {
                        stack.push(Task::Collection {
                            path,
                            cursor: Some(next),
                        });
                    }
                    for child in page.documents.into_iter().rev() {
                        stack.push(Task::Expand(child.path().clone()));
                    }
                }
                Task::Delete(doc) => {
                    self.delete_one(&doc, &mut sink).await?;
                    report.documents_deleted += 1;
                }
            }
        }

        debug!(
            "delete of {}: {} documents, {} collections",
            root, report.documents_deleted, report.collections_visited
        );
        Ok(report)
    }

    /// Delete several subtrees in order; used to clean up ghost documents.
    pub async fn delete_documents(
        &self,
        roots: &[DocumentPath],
        mut sink: DeleteSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeleteReport> {
        let mut total = DeleteReport::default();
        for root in roots {
            let sink = match &mut sink {
                DeleteSink::Direct => DeleteSink::Direct,
                DeleteSink::Preview => DeleteSink::Preview,
                DeleteSink::Batched(writer) => DeleteSink::Batched(&mut **writer),
            };
            let report = self.delete_tree(root, sink, cancel).await?;
            total.merge(&report);
            if report.cancelled {
                break;
            }
        }
        info!(
            "deleted {} trees ({} documents)",
            roots.len(),
            total.documents_deleted
        );
        Ok(total)
    }

    async fn delete_one(&self, doc: &DocumentPath, sink: &mut DeleteSink<'_>) -> Result<()> {
        match sink {
            DeleteSink::Direct => {
                let existed = self
                    .retry
                    .run(&format!("delete of {}", doc), || self.store.delete_document(doc))
                    .await?;
                if !existed {
                    debug!("{} was already gone", doc);
                }
            }
            DeleteSink::Batched(writer) => {
                writer
                    .enqueue(MutationOp::DeleteDocument {
                        path: doc.clone(),
                        recursive: false,
                    })
                    .await?;
            }
            DeleteSink::Preview => debug!("dry-run: would delete {}", doc),
        }
        Ok(())
    }
}
