//! Error types for the orchestrator.

use std::path::PathBuf;

use thiserror::Error;

use crate::client::SubmitError;
use crate::domain::batch::{BatchId, BatchStatus};

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Process exit code used when the exclusive run lease is already held.
///
/// A second concurrent writer risks double-submission and a split-brain
/// registry, so lock conflicts terminate the process with this code and
/// without touching the registry.
pub const LOCK_CONFLICT_EXIT_CODE: i32 = 3;

/// Main error type for the orchestrator.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// Another orchestrator instance holds the exclusive run lease.
    #[error("another instance is already running (lease {path} held by pid {pid})")]
    AlreadyRunning { path: PathBuf, pid: u32 },

    /// The persisted registry exists but cannot be parsed.
    ///
    /// This is deliberately fatal: silently resetting the registry would
    /// re-submit already-billed work.
    #[error("registry at {path} is unreadable: {source}")]
    CorruptRegistry {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Batch not found in the registry.
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Item not found in the given batch.
    #[error("item not found in batch {batch}: {identity}")]
    ItemNotFound { batch: BatchId, identity: String },

    /// A backward or skipping batch status transition was attempted.
    /// Batch transitions are monotonic: collecting -> ready -> sent -> completed.
    #[error("invalid batch transition for {batch}: {from} -> {to}")]
    InvalidTransition {
        batch: BatchId,
        from: BatchStatus,
        to: BatchStatus,
    },

    /// An item is already owned by a different active batch.
    #[error("item {identity} is already owned by active batch {batch}")]
    ItemAlreadyOwned { identity: String, batch: BatchId },

    /// The external submission service failed.
    #[error("submission service error: {0}")]
    Submit(#[from] SubmitError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VolleyError {
    /// Map this error to a process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            VolleyError::AlreadyRunning { .. } => LOCK_CONFLICT_EXIT_CODE,
            _ => 1,
        }
    }
}
