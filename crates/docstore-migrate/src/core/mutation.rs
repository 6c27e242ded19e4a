//! Mutation operations queued into batches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::document::{Document, FieldWrite};
use super::path::{DocumentPath, FieldPath};
use crate::error::{MigrateError, Result};

/// A single write against one document.
///
/// Every variant counts as one operation against the batch limit. A
/// `RenameField` is applied by the store as one unit (delete old, set new).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOp {
    /// Set a field on an existing document. Fails the commit if the document is missing.
    SetField {
        path: DocumentPath,
        field: FieldPath,
        value: Value,
    },

    /// Remove a field from an existing document.
    DeleteField { path: DocumentPath, field: FieldPath },

    /// Move the value of `from` to `to`. No-op when `from` is absent.
    RenameField {
        path: DocumentPath,
        from: FieldPath,
        to: FieldPath,
    },

    /// Create-or-merge: applies each write, creating the document if needed.
    MergeFields {
        path: DocumentPath,
        fields: BTreeMap<FieldPath, FieldWrite>,
    },

    /// Delete the document. With `recursive`, its subcollections go first.
    DeleteDocument { path: DocumentPath, recursive: bool },
}

impl MutationOp {
    /// Target document of this op.
    pub fn path(&self) -> &DocumentPath {
        match self {
            MutationOp::SetField { path, .. }
            | MutationOp::DeleteField { path, .. }
            | MutationOp::RenameField { path, .. }
            | MutationOp::MergeFields { path, .. }
            | MutationOp::DeleteDocument { path, .. } => path,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MutationOp::SetField { .. } => "set_field",
            MutationOp::DeleteField { .. } => "delete_field",
            MutationOp::RenameField { .. } => "rename_field",
            MutationOp::MergeFields { .. } => "merge_fields",
            MutationOp::DeleteDocument { .. } => "delete_document",
        }
    }

    /// Whether the op needs the target document to already exist.
    pub fn requires_existing(&self) -> bool {
        matches!(
            self,
            MutationOp::SetField { .. }
                | MutationOp::DeleteField { .. }
                | MutationOp::RenameField { .. }
        )
    }

    /// Check the op is well formed before it is queued.
    pub fn validate(&self) -> Result<()> {
        match self {
            MutationOp::RenameField { path, from, to } => {
                if from.starts_with(to) || to.starts_with(from) {
                    return Err(MigrateError::validation(
                        path.as_str(),
                        format!("cannot rename field '{}' to '{}'", from, to),
                    ));
                }
            }
            MutationOp::MergeFields { path, fields } => {
                if fields.is_empty() {
                    return Err(MigrateError::validation(
                        path.as_str(),
                        "merge_fields requires at least one field",
                    ));
                }
                let keys: Vec<&FieldPath> = fields.keys().collect();
                for (i, a) in keys.iter().enumerate() {
                    for b in &keys[i + 1..] {
                        if a.starts_with(b) || b.starts_with(a) {
                            return Err(MigrateError::validation(
                                path.as_str(),
                                format!("merge_fields has overlapping fields '{}' and '{}'", a, b),
                            ));
                        }
                    }
                }
            }
            MutationOp::SetField { .. }
            | MutationOp::DeleteField { .. }
            | MutationOp::DeleteDocument { .. } => {}
        }
        Ok(())
    }

    /// Apply a field-level op to a document.
    ///
    /// `DeleteDocument` has no field effect and leaves the document untouched;
    /// the store removes the document itself.
    pub fn apply_to(&self, doc: &mut Document) {
        match self {
            MutationOp::SetField { field, value, .. } => doc.set(field, value.clone()),
            MutationOp::DeleteField { field, .. } => {
                doc.remove(field);
            }
            MutationOp::RenameField { from, to, .. } => {
                if let Some(value) = doc.remove(from) {
                    doc.set(to, value);
                }
            }
            MutationOp::MergeFields { fields, .. } => {
                for (field, write) in fields {
                    doc.apply(field, write);
                }
            }
            MutationOp::DeleteDocument { .. } => {}
        }
    }

    /// Whether applying this op to `doc` would change nothing.
    pub fn is_noop_for(&self, doc: &Document) -> bool {
        if doc.path() != self.path() {
            return false;
        }
        match self {
            MutationOp::SetField { field, value, .. } => doc.get(field) == Some(value),
            MutationOp::DeleteField { field, .. } => !doc.contains(field),
            MutationOp::RenameField { from, .. } => !doc.contains(from),
            MutationOp::MergeFields { fields, .. } => fields
                .iter()
                .all(|(field, write)| doc.already_satisfies(field, write)),
            MutationOp::DeleteDocument { .. } => false,
        }
    }
}
