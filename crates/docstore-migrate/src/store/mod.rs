//! Document store abstraction consumed by the engine.
//!
//! The [`DocumentStore`] trait is the only way the engine touches data: paginated
//! listing, subcollection discovery, atomic batch commits and single-document
//! deletes. [`MemoryStore`] is the bundled
//! implementation used by the CLI (backed by a JSON snapshot) and by tests.

mod memory;

pub use memory::{FaultPlan, MemoryStore, DEFAULT_HARD_CAP};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{CollectionPath, Document, DocumentPath, FieldPath, MutationOp};
use crate::error::Result;

/// Opaque continuation token returned by [`DocumentStore::list_collection`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of a collection listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub documents: Vec<Document>,
    /// `None` when the collection is exhausted.
    pub next_cursor: Option<Cursor>,
}

/// Equality predicate pushed down to the store (`where field == value`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqualityFilter {
    pub field: FieldPath,
    pub equals: Value,
}

impl EqualityFilter {
    pub fn new(field: FieldPath, equals: Value) -> Self {
        Self { field, equals }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        doc.get(&self.field) == Some(&self.equals)
    }
}

/// Read and write access to a hierarchical document store.
///
/// Implementations must be `Send + Sync`; one store is shared by every worker
/// of a run.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a single document. Absence is `Ok(None)`.
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>>;

    /// List up to `page_size` documents after `cursor`, in insertion order.
    async fn list_collection(
        &self,
        path: &CollectionPath,
        cursor: Option<&Cursor>,
        page_size: usize,
        filter: Option<&EqualityFilter>,
    ) -> Result<Page>;

    /// Immediate subcollections of a document that currently hold documents.
    async fn list_subcollections(&self, path: &DocumentPath) -> Result<Vec<CollectionPath>>;

    /// Apply all ops atomically: either every op succeeds or none is applied.
    ///
    /// Fails with `BatchInvariant` when `ops.len()` exceeds [`max_batch_ops`].
    ///
    /// [`max_batch_ops`]: DocumentStore::max_batch_ops
    async fn commit_batch(&self, ops: &[MutationOp]) -> Result<()>;

    /// Delete one document (not its subcollections).
    ///
    /// Returns whether the document existed; a missing document is not an error.
    async fn delete_document(&self, path: &DocumentPath) -> Result<bool>;

    /// Hard per-commit operation limit.
    fn max_batch_ops(&self) -> usize;

    /// Store type name for logging.
    fn store_type(&self) -> &'static str;
}
