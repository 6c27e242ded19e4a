//! Mutation planning: document in, ordered ops out.
//!
//! Planners are pure. They never touch the store, so the same planner drives
//! both live runs and dry-run previews, and the same document always yields
//! the same ops.

mod plan;

pub use plan::{Condition, DeclarativePlanner, MutationPlan, OpTemplate, Sampling, WriteMode};

use crate::core::{Document, MutationOp};
use crate::error::Result;

/// Maps one document to zero or more mutation ops.
///
/// An `Err` (normally `MigrateError::Validation`) marks that single document
/// as failed; the run continues with the next one.
pub trait MutationPlanner: Send + Sync {
    fn plan(&self, doc: &Document) -> Result<Vec<MutationOp>>;

    /// Name used in logs and results.
    fn name(&self) -> &str {
        "planner"
    }
}

/// Planner backed by a closure, for migrations written in code.
pub struct FnPlanner<F> {
    name: String,
    f: F,
}

impl<F> FnPlanner<F>
where
    F: Fn(&Document) -> Result<Vec<MutationOp>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> MutationPlanner for FnPlanner<F>
where
    F: Fn(&Document) -> Result<Vec<MutationOp>> + Send + Sync,
{
    fn plan(&self, doc: &Document) -> Result<Vec<MutationOp>> {
        (self.f)(doc)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
