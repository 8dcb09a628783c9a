//! Item types and the per-item state machine.
//!
//! An item is one unit of work: a file that needs a user-supplied description
//! and a generated result. Items progress through
//! `pending -> description_saved -> submitted -> completed -> reconciled`,
//! with `error` reachable from any non-terminal state.

use serde::{Deserialize, Serialize};

/// Stable identity of one unit of work: path plus content hash.
///
/// The path alone is not stable (files get renamed or re-exported), so the
/// registry keys items by the combination of both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemIdentity {
    pub path: String,
    pub content_hash: String,
}

impl ItemIdentity {
    /// Create an identity with a normalized path (forward slashes only).
    pub fn new(path: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            path: path.into().replace('\\', "/"),
            content_hash: content_hash.into(),
        }
    }

    /// Canonical registry key for this identity.
    pub fn key(&self) -> String {
        format!("{}#{}", self.path, self.content_hash)
    }
}

impl std::fmt::Display for ItemIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// Kind of work grouped into a batch.
///
/// Kinds have different downstream processing and are never mixed in one
/// external job. Variant work is derived from a prior original result and is
/// only collected once its source item has been reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tag", rename_all = "snake_case")]
pub enum ItemKind {
    /// First-pass, image-based description work.
    Original,
    /// Text-only work derived from an original's result (e.g. an edited copy).
    Variant(String),
}

impl ItemKind {
    /// True for kinds that depend on a prerequisite original item.
    pub fn is_derived(&self) -> bool {
        matches!(self, ItemKind::Variant(_))
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::Original => write!(f, "original"),
            ItemKind::Variant(tag) => write!(f, "variant:{}", tag),
        }
    }
}

/// Per-item status within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    DescriptionSaved,
    Submitted,
    Completed,
    Reconciled,
    Error,
}

impl ItemStatus {
    /// Check if this status is terminal (reconciled or error).
    ///
    /// Errored items below the retry bound may still be requeued into a new
    /// batch, but within their current batch they are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Reconciled | ItemStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::DescriptionSaved => "description_saved",
            ItemStatus::Submitted => "submitted",
            ItemStatus::Completed => "completed",
            ItemStatus::Reconciled => "reconciled",
            ItemStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One item's registry entry within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEntry {
    pub identity: ItemIdentity,
    pub status: ItemStatus,
    /// User-supplied text, set when the item reaches `description_saved`.
    pub description: Option<String>,
    /// Per-job request id, assigned when the item is grouped into a batch.
    pub external_request_id: Option<String>,
    /// Structured payload returned by the external service.
    pub result: Option<serde_json::Value>,
    /// Reason string for the most recent error, if any.
    pub error: Option<String>,
    /// Number of failed submission cycles this item has been through.
    pub retries: u32,
    /// Image dimensions, if known, for cost estimation.
    pub image_dims: Option<(u32, u32)>,
    /// Prerequisite item for derived kinds.
    pub source: Option<ItemIdentity>,
}

impl ItemEntry {
    pub fn new(identity: ItemIdentity) -> Self {
        Self {
            identity,
            status: ItemStatus::Pending,
            description: None,
            external_request_id: None,
            result: None,
            error: None,
            retries: 0,
            image_dims: None,
            source: None,
        }
    }

    /// Mark this entry errored with a reason, preserving the retry counter.
    pub fn mark_error(&mut self, reason: impl Into<String>) {
        self.status = ItemStatus::Error;
        self.error = Some(reason.into());
    }
}
