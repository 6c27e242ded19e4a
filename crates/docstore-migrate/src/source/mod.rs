//! Paginated, cursor-based document scanning.
//!
//! A [`DocumentSource`] walks one collection page by page. Each page is a
//! fresh read: writes made after a page was fetched are not reflected in it,
//! and there is no snapshot across pages. Migrations are idempotent, so a
//! document seen twice or changed between pages is harmless.

use std::sync::Arc;

use futures::stream::{self, Stream, TryStreamExt};
use tracing::debug;

use crate::core::{CollectionPath, Document};
use crate::error::{MigrateError, Result};
use crate::retry::RetryPolicy;
use crate::store::{Cursor, DocumentStore, EqualityFilter};

/// Lazy, restartable scan of a collection.
pub struct DocumentSource {
    store: Arc<dyn DocumentStore>,
    collection: CollectionPath,
    page_size: usize,
    filter: Option<EqualityFilter>,
    retry: RetryPolicy,
    cursor: Option<Cursor>,
    exhausted: bool,
    pages_fetched: u64,
}

impl DocumentSource {
    /// Scan `collection` from the start, `page_size` documents per fetch.
    pub fn scan(store: Arc<dyn DocumentStore>, collection: CollectionPath, page_size: usize) -> Self {
        Self {
            store,
            collection,
            page_size: page_size.max(1),
            filter: None,
            retry: RetryPolicy::default(),
            cursor: None,
            exhausted: false,
            pages_fetched: 0,
        }
    }

    /// Only return documents where `filter.field == filter.equals`.
    pub fn with_filter(mut self, filter: Option<EqualityFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resume after a previously reported cursor.
    pub fn starting_after(mut self, cursor: Option<Cursor>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    /// Cursor after the last fully fetched page.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    /// Fetch the next non-empty page, or `None` when the collection is done.
    ///
    /// Transient failures are retried under the configured policy; permission
    /// errors surface immediately.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Document>>> {
        while !self.exhausted {
            let store = &self.store;
            let collection = &self.collection;
            let cursor = self.cursor.as_ref();
            let filter = self.filter.as_ref();
            let page_size = self.page_size;
            let what = format!("page fetch from {}", collection);

            let page = self
                .retry
                .run(&what, || {
                    store.list_collection(collection, cursor, page_size, filter)
                })
                .await?;
            self.pages_fetched += 1;

            debug!(
                "{}: page {} returned {} documents",
                self.collection,
                self.pages_fetched,
                page.documents.len()
            );

            match page.next_cursor {
                Some(next) => {
                    if self.cursor.as_ref() == Some(&next) {
                        return Err(MigrateError::State(format!(
                            "store returned the same cursor twice while scanning {}",
                            self.collection
                        )));
                    }
                    self.cursor = Some(next);
                }
                None => self.exhausted = true,
            }

            if !page.documents.is_empty() {
                return Ok(Some(page.documents));
            }
        }
        Ok(None)
    }

    /// Flatten the scan into a stream of documents.
    pub fn into_stream(self) -> impl Stream<Item = Result<Document>> {
        stream::try_unfold(self, |mut source| async move {
            Ok::<_, MigrateError>(source.next_page().await?.map(|docs| {
                (
                    stream::iter(docs.into_iter().map(Ok::<Document, MigrateError>)),
                    source,
                )
            }))
        })
        .try_flatten()
    }
}
