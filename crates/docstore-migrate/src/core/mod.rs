//! Core data model shared by every engine component.
//!
//! - [`path`]: collection, document and field paths
//! - [`document`]: documents and the field-delete sentinel
//! - [`mutation`]: the operations queued into batches

pub mod document;
pub mod mutation;
pub mod path;

pub use document::{Document, FieldWrite};
pub use mutation::MutationOp;
pub use path::{CollectionPath, DocumentPath, FieldPath};
