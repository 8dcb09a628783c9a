//! Batch types for grouping items into external jobs.
//!
//! A batch is a group of items of a single kind that are submitted together.
//! Batch status transitions are monotonic and one-directional:
//! `collecting -> ready -> sent -> completed`. A batch in `sent` never gains
//! new items; backward transitions are rejected by the registry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::item::{ItemEntry, ItemKind, ItemStatus};

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }

    /// Short prefix used in request ids and log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        BatchId(uuid)
    }
}

impl std::ops::Deref for BatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Batch status. Transitions are strictly forward, one step at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Accepting new items.
    Collecting,
    /// Full (or finalized) and waiting for submission.
    Ready,
    /// Submitted to the external service; owns an external job id.
    Sent,
    /// The external job finished and results were handed to reconciliation.
    Completed,
}

impl BatchStatus {
    fn rank(self) -> u8 {
        match self {
            BatchStatus::Collecting => 0,
            BatchStatus::Ready => 1,
            BatchStatus::Sent => 2,
            BatchStatus::Completed => 3,
        }
    }

    /// Check whether `next` is the single legal forward step from here.
    pub fn can_advance_to(self, next: BatchStatus) -> bool {
        next.rank() == self.rank() + 1
    }

    /// Active batches own their items for exclusion purposes.
    pub fn owns_items(self) -> bool {
        matches!(
            self,
            BatchStatus::Collecting | BatchStatus::Ready | BatchStatus::Sent
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Collecting => "collecting",
            BatchStatus::Ready => "ready",
            BatchStatus::Sent => "sent",
            BatchStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A batch record as persisted in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub kind: ItemKind,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    /// External job id, set once the batch is sent.
    pub external_job_id: Option<String>,
    /// Items keyed by identity key.
    pub items: BTreeMap<String, ItemEntry>,
}

impl BatchRecord {
    pub fn new(kind: ItemKind) -> Self {
        Self {
            id: BatchId::new(),
            kind,
            status: BatchStatus::Collecting,
            created_at: Utc::now(),
            external_job_id: None,
            items: BTreeMap::new(),
        }
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Iterate items currently in the given status.
    pub fn items_with_status(&self, status: ItemStatus) -> impl Iterator<Item = &ItemEntry> {
        self.items.values().filter(move |e| e.status == status)
    }

    /// Find an item by its per-job request id.
    pub fn item_by_request_id_mut(&mut self, request_id: &str) -> Option<&mut ItemEntry> {
        self.items
            .values_mut()
            .find(|e| e.external_request_id.as_deref() == Some(request_id))
    }

    /// True once every item is reconciled or errored.
    pub fn all_items_settled(&self) -> bool {
        self.items.values().all(|e| e.status.is_terminal())
    }

    /// Next request id for an item grouped into this batch.
    pub fn next_request_id(&self) -> String {
        format!("{}_{:04}", self.short_id(), self.items.len())
    }

    fn short_id(&self) -> String {
        self.id.short()
    }
}

/// Entry in the retired-batch log.
///
/// Retired batches keep only a summary; their artifact directory is purged
/// after the retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredBatch {
    pub id: BatchId,
    pub kind: ItemKind,
    pub retired_at: DateTime<Utc>,
    pub reason: String,
    pub item_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_single_forward_steps() {
        use BatchStatus::*;
        assert!(Collecting.can_advance_to(Ready));
        assert!(Ready.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Completed));

        // No backward edges
        assert!(!Sent.can_advance_to(Collecting));
        assert!(!Ready.can_advance_to(Collecting));
        assert!(!Completed.can_advance_to(Sent));
        // No skipping
        assert!(!Collecting.can_advance_to(Sent));
        assert!(!Ready.can_advance_to(Completed));
    }

    #[test]
    fn active_statuses_own_items() {
        assert!(BatchStatus::Collecting.owns_items());
        assert!(BatchStatus::Ready.owns_items());
        assert!(BatchStatus::Sent.owns_items());
        assert!(!BatchStatus::Completed.owns_items());
    }

    #[test]
    fn request_ids_are_prefixed_with_batch_id() {
        let batch = BatchRecord::new(ItemKind::Original);
        let rid = batch.next_request_id();
        assert!(rid.starts_with(&batch.id.short()));
        assert!(rid.ends_with("_0000"));
    }
}
