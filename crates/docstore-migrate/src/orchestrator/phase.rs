//! Run phases and their legal transitions.

use std::fmt;

use tracing::trace;

use crate::error::{MigrateError, Result};

/// Phase of one collection job.
///
/// ```text
/// Idle → Scanning ⇄ Planning → Writing → Scanning
///        Scanning → Flushing → Done | Cancelled | Failed
/// ```
///
/// Any non-terminal phase may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Scanning,
    Planning,
    Writing,
    Flushing,
    Done,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed | RunPhase::Cancelled)
    }

    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, Scanning)
                | (Scanning, Planning)
                | (Scanning, Flushing)
                | (Planning, Writing)
                | (Planning, Scanning)
                | (Writing, Scanning)
                | (Flushing, Done)
                | (Flushing, Cancelled)
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Scanning => "scanning",
            RunPhase::Planning => "planning",
            RunPhase::Writing => "writing",
            RunPhase::Flushing => "flushing",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
            RunPhase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Current phase of a job, enforcing the transition table.
#[derive(Debug)]
pub struct PhaseTracker {
    label: String,
    phase: RunPhase,
}

impl PhaseTracker {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            phase: RunPhase::Idle,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Move to `next`, or fail with a state error if the move is illegal.
    pub fn advance(&mut self, next: RunPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(MigrateError::State(format!(
                "{}: illegal phase transition {} -> {}",
                self.label, self.phase, next
            )));
        }
        trace!("{}: {} -> {}", self.label, self.phase, next);
        self.phase = next;
        Ok(())
    }
}
