//! Reconciliation: apply fetched job results to downstream records.
//!
//! Each result row is reconciled in its own registry transaction, so a crash
//! mid-batch loses at most the row in flight and a re-run picks up exactly
//! where it stopped. Records are only written through the sentinel-guarded
//! [`Record::apply`], which makes the whole pass idempotent.

use crate::client::JobResult;
use crate::domain::batch::BatchId;
use crate::domain::item::ItemStatus;
use crate::error::Result;
use crate::records::{GeneratedFields, RecordStore};
use crate::registry::RegistryStore;

/// Outcome of one reconciliation pass over a batch.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    /// Items whose record was filled in this pass.
    pub reconciled: usize,
    /// Items already reconciled by an earlier pass.
    pub skipped: usize,
    /// Items that could not be reconciled: (request id, reason).
    pub errors: Vec<(String, String)>,
}

/// Apply `results` to the items of `batch_id`.
///
/// Failures are isolated per item: a malformed payload or missing record
/// errors that item and moves on to its siblings. Items left `submitted`
/// with no matching result row are errored as missing.
pub fn reconcile(
    store: &RegistryStore,
    records: &dyn RecordStore,
    batch_id: BatchId,
    results: &[JobResult],
) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();

    for result in results {
        let outcome = store.with_lock(|reg| {
            let batch = reg.batch_mut(batch_id)?;
            let Some(entry) = batch.item_by_request_id_mut(&result.custom_id) else {
                return Ok(RowOutcome::Error("unknown_request_id".to_string()));
            };
            if entry.status == ItemStatus::Reconciled {
                return Ok(RowOutcome::Skipped);
            }

            let payload = match &result.payload {
                Ok(payload) => payload,
                Err(reason) => {
                    entry.mark_error(reason.clone());
                    return Ok(RowOutcome::Error(reason.clone()));
                }
            };
            let Some(fields) = parse_result_fields(payload) else {
                entry.mark_error("unparseable_result");
                return Ok(RowOutcome::Error("unparseable_result".to_string()));
            };
            entry.status = ItemStatus::Completed;
            entry.result = Some(payload.clone());

            let identity = entry.identity.clone();
            let Some(mut record) = records.load_record(&identity)? else {
                entry.mark_error("record_missing");
                return Ok(RowOutcome::Error("record_missing".to_string()));
            };

            record.apply(&fields);
            records.save_record(&identity, &record)?;

            let batch = reg.batch_mut(batch_id)?;
            if let Some(entry) = batch.item_by_request_id_mut(&result.custom_id) {
                entry.status = ItemStatus::Reconciled;
                entry.error = None;
            }
            Ok(RowOutcome::Reconciled)
        })?;

        match outcome {
            RowOutcome::Reconciled => summary.reconciled += 1,
            RowOutcome::Skipped => summary.skipped += 1,
            RowOutcome::Error(reason) => {
                tracing::warn!(request_id = %result.custom_id, %reason, "item failed to reconcile");
                summary.errors.push((result.custom_id.clone(), reason));
            }
        }
    }

    // Items the service never answered for.
    let missing = store.with_lock(|reg| {
        let batch = reg.batch_mut(batch_id)?;
        let mut missing = Vec::new();
        for entry in batch.items.values_mut() {
            if entry.status == ItemStatus::Submitted {
                entry.mark_error("missing_result");
                if let Some(rid) = entry.external_request_id.clone() {
                    missing.push(rid);
                }
            }
        }
        Ok(missing)
    })?;
    for rid in missing {
        tracing::warn!(request_id = %rid, "no result row returned for submitted item");
        summary.errors.push((rid, "missing_result".to_string()));
    }

    tracing::info!(
        batch = %batch_id,
        reconciled = summary.reconciled,
        skipped = summary.skipped,
        errors = summary.errors.len(),
        "reconciliation pass complete"
    );
    Ok(summary)
}

enum RowOutcome {
    Reconciled,
    Skipped,
    Error(String),
}

/// Extract generated fields from a result payload.
///
/// Accepts either the bare fields object, a chat-completion body whose
/// message content is a JSON string, or that string wrapped in a markdown
/// code fence.
pub fn parse_result_fields(payload: &serde_json::Value) -> Option<GeneratedFields> {
    if let Some(content) = payload
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
    {
        return parse_fields_text(content);
    }
    if let Some(text) = payload.as_str() {
        return parse_fields_text(text);
    }
    fields_from_value(payload.clone())
}

fn parse_fields_text(text: &str) -> Option<GeneratedFields> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    let value: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    fields_from_value(value)
}

fn fields_from_value(value: serde_json::Value) -> Option<GeneratedFields> {
    let fields: GeneratedFields = serde_json::from_value(value).ok()?;
    if fields.title.trim().is_empty() {
        return None;
    }
    Some(fields)
}
