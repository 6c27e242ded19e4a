//! Error types for the migration engine.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Timeout, network blip or rate limit. Safe to retry.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Access denied by the store. Never retried.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// A write required an existing document that is not there.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Document or operation has an unexpected shape.
    #[error("Validation failed for {path}: {message}")]
    Validation { path: String, message: String },

    /// A batch reached commit with more ops than allowed.
    #[error("Batch invariant violated: {size} ops exceeds limit of {limit}")]
    BatchInvariant { size: usize, limit: usize },

    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Run state machine or resume state error
    #[error("State error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Use `run` to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Validation error for a document or collection path.
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MigrateError::Transient(_))
    }

    /// Whether the error concerns a single document and should not abort a run.
    pub fn is_document_scoped(&self) -> bool {
        matches!(self, MigrateError::Validation { .. })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::ConfigChanged => 2,
            MigrateError::Permission(_) => 3,
            MigrateError::Transient(_) => 4,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
