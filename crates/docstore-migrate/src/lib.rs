//! # docstore-migrate
//!
//! Batched migrations over hierarchical document stores.
//!
//! The engine scans a collection page by page, asks a planner which ops each
//! document needs, and commits those ops in atomic batches that stay under
//! the store's per-commit cap. It provides:
//!
//! - **Declarative plans** (`MutationPlan`) for renames, field rewrites,
//!   sibling-document copies and deletes, with conditions and seeded sampling
//! - **Batched writes** with transient-failure retry and dry-run previews
//! - **Recursive deletes** of documents together with their subcollections
//! - **Fan-out runs** over every parent's subcollection on a bounded worker pool
//! - **Resume capability** via signed JSON state files
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use docstore_migrate::{Config, MemoryStore, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> docstore_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let store = Arc::new(MemoryStore::load_json(&config.store.path, config.store.hard_cap)?);
//!     let result = Orchestrator::new(config, store)?
//!         .run(CancellationToken::new())
//!         .await?;
//!     println!("Updated {} of {} documents", result.updated, result.scanned);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod deleter;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod source;
pub mod state;
pub mod store;
pub mod writer;

// Re-exports for convenient access
pub use crate::core::{CollectionPath, Document, DocumentPath, FieldPath, FieldWrite, MutationOp};
pub use config::{Config, MigrationConfig, StoreConfig};
pub use deleter::{DeleteReport, DeleteSink, RecursiveDeleter};
pub use error::{MigrateError, Result};
pub use orchestrator::{MigrationResult, Orchestrator, RunOutput};
pub use planner::{DeclarativePlanner, FnPlanner, MutationPlan, MutationPlanner};
pub use progress::{Outcome, ProgressReporter};
pub use retry::RetryPolicy;
pub use source::DocumentSource;
pub use state::{MigrationState, RunStatus};
pub use store::{Cursor, DocumentStore, EqualityFilter, MemoryStore, Page};
pub use writer::{BatchWriter, WriterStats};
