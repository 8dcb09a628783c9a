//! Stateful batch-submission orchestrator.
//!
//! `volley` collects described work items into batches, submits them to an
//! external batch-inference service, and reconciles the results into
//! downstream records. All orchestration state lives in a crash-safe JSON
//! registry guarded by an exclusive run lease, so interrupted runs resume
//! instead of double-submitting.

pub mod client;
pub mod config;
pub mod describe;
pub mod domain;
pub mod error;
pub mod estimate;
pub mod guard;
pub mod orchestrator;
pub mod reconcile;
pub mod records;
pub mod registry;

pub use client::{JobItem, JobResult, JobStatus, SubmissionClient, SubmitError};
pub use config::OrchestratorConfig;
pub use error::{Result, VolleyError, LOCK_CONFLICT_EXIT_CODE};
pub use guard::RunLease;
pub use orchestrator::{Orchestrator, RunSummary};
pub use registry::RegistryStore;
