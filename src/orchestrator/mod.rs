//! The run loop: retrieve finished jobs, send ready batches, collect new
//! items.
//!
//! A run is three phases in a fixed order. Retrieval comes first so results
//! land and retired batches release their items before anything new is
//! claimed; sending comes second so batches finalized by a previous run go
//! out before the interactive collection phase; collection is last and
//! finalizes what it gathers for the next run. Every registry mutation is a
//! single transaction, so a crash between any two steps leaves a state a
//! re-run picks up cleanly.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use futures::future::join_all;
use serde_json::json;

use crate::client::{JobItem, JobResult, JobStatus, SubmissionClient, SubmitError};
use crate::config::OrchestratorConfig;
use crate::describe::{AcquireOutcome, DescriptionSource};
use crate::domain::batch::{BatchId, BatchRecord, BatchStatus};
use crate::domain::item::{ItemEntry, ItemIdentity, ItemKind, ItemStatus};
use crate::error::{Result, VolleyError};
use crate::estimate::{CostEstimator, EstimateItem};
use crate::guard::filter_unowned;
use crate::reconcile::reconcile;
use crate::records::{mark_rejected, RecordStore};
use crate::registry::{date_key, promote_described_items, CostRecord, Registry, RegistryStore};

const SYSTEM_PROMPT: &str = "You are a metadata writer. Given a short description of an image, \
return a JSON object with fields \"title\" (a concise title), \"description\" (two to three \
sentences), and \"keywords\" (an array of up to 30 single words).";

/// Counters reported at the end of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Items whose results were applied to records this run.
    pub reconciled: usize,
    /// Items that ended in a permanent error this run.
    pub errored: usize,
    /// Batches handed to the submission service this run.
    pub submitted_batches: usize,
    /// New items claimed during collection this run.
    pub collected_items: usize,
    /// Batches still awaiting results when the run ended.
    pub in_flight: usize,
    /// Reason per errored item: (item or request id, reason).
    pub error_reasons: Vec<(String, String)>,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reconciled {} item(s), {} errored, submitted {} batch(es), collected {} item(s), {} batch(es) in flight",
            self.reconciled, self.errored, self.submitted_batches, self.collected_items, self.in_flight
        )?;
        for (item, reason) in &self.error_reasons {
            write!(f, "\n  error {item}: {reason}")?;
        }
        Ok(())
    }
}

/// Sum the usage counts the provider attached to result payloads. `None`
/// when no row carried usage, so the estimate is left standing alone.
fn reported_usage(results: &[JobResult]) -> Option<(u64, u64)> {
    let mut input = 0u64;
    let mut output = 0u64;
    let mut seen = false;
    for payload in results.iter().filter_map(|r| r.payload.as_ref().ok()) {
        let Some(usage) = payload.get("usage") else {
            continue;
        };
        input += usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        output += usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        seen = true;
    }
    seen.then_some((input, output))
}

/// Drives the batch lifecycle against a registry, a record store, and a
/// submission client.
pub struct Orchestrator<C: SubmissionClient> {
    store: Arc<RegistryStore>,
    client: Arc<C>,
    records: Arc<dyn RecordStore>,
    descriptions: Arc<dyn DescriptionSource>,
    estimator: CostEstimator,
    config: OrchestratorConfig,
}

impl<C: SubmissionClient> Orchestrator<C> {
    pub fn new(
        store: Arc<RegistryStore>,
        client: Arc<C>,
        records: Arc<dyn RecordStore>,
        descriptions: Arc<dyn DescriptionSource>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            client,
            records,
            descriptions,
            estimator: CostEstimator::new(config.cost.clone()),
            config,
        }
    }

    /// Execute one full run: retrieve, send, collect, then optionally wait
    /// for in-flight batches and purge aged-out retired batches.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        self.phase_retrieve(&mut summary).await?;
        self.phase_send(&mut summary).await?;
        self.phase_collect(&mut summary)?;

        if let Some(timeout) = self.config.wait_timeout {
            self.wait_for_inflight(timeout, &mut summary).await?;
        }

        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        self.store.purge_retired(cutoff)?;

        summary.in_flight = self
            .store
            .load()?
            .active_batches(Some(BatchStatus::Sent))
            .len();
        tracing::info!(%summary, "run complete");
        Ok(summary)
    }

    // ---- phase 1: retrieve ------------------------------------------------

    async fn phase_retrieve(&self, summary: &mut RunSummary) -> Result<()> {
        let sent: Vec<(BatchId, String)> = self
            .store
            .load()?
            .active_batches(Some(BatchStatus::Sent))
            .into_iter()
            .filter_map(|b| Some((b.id, b.external_job_id.clone()?)))
            .collect();
        if sent.is_empty() {
            return Ok(());
        }

        let polls = join_all(sent.iter().map(|(id, job_id)| {
            let client = Arc::clone(&self.client);
            async move { (*id, job_id.clone(), client.poll_status(job_id).await) }
        }))
        .await;

        for (batch_id, job_id, status) in polls {
            match status {
                Ok(JobStatus::InProgress { completed, total }) => {
                    tracing::info!(batch = %batch_id, %job_id, completed, total, "batch still in progress");
                }
                Ok(JobStatus::Completed) => {
                    self.retrieve_completed(batch_id, &job_id, summary).await?;
                }
                Ok(JobStatus::Failed { reason }) => {
                    tracing::warn!(batch = %batch_id, %job_id, %reason, "batch job failed");
                    self.fail_batch(batch_id, &format!("job failed: {reason}"), summary)?;
                }
                Ok(JobStatus::Expired) => {
                    tracing::warn!(batch = %batch_id, %job_id, "batch job expired");
                    self.fail_batch(batch_id, "job expired", summary)?;
                }
                Err(e) => {
                    // Leave the batch sent; the next run polls again.
                    tracing::warn!(batch = %batch_id, %job_id, error = %e, "status poll failed");
                }
            }
        }
        Ok(())
    }

    async fn retrieve_completed(
        &self,
        batch_id: BatchId,
        job_id: &str,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut results: Vec<JobResult> = Vec::new();
        let mut stream = match self.client.fetch_results(job_id).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(batch = %batch_id, %job_id, error = %e, "result fetch failed");
                return Ok(());
            }
        };
        while let Some(row) = stream.next().await {
            match row {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::warn!(batch = %batch_id, %job_id, error = %e, "result stream failed");
                    return Ok(());
                }
            }
        }

        let artifacts = self.store.artifacts(batch_id)?;
        artifacts.write_results(&results)?;
        if let Some((input, output)) = reported_usage(&results) {
            let actual = self.estimator.cost_for(input, output);
            if let Err(e) = artifacts.record_actual_cost(actual) {
                tracing::warn!(batch = %batch_id, error = %e, "failed to record actual cost");
            } else {
                tracing::info!(batch = %batch_id, input_units = input, output_units = output, cost_usd = actual, "actual cost recorded");
            }
        }

        // Reconcile before the status flip: if we crash in between, the
        // sentinel guard makes the repeated reconcile a no-op.
        let outcome = reconcile(&self.store, self.records.as_ref(), batch_id, &results)?;
        summary.reconciled += outcome.reconciled;
        summary.errored += outcome.errors.len();
        summary.error_reasons.extend(outcome.errors);

        self.store.with_lock(|reg| {
            reg.set_batch_status(batch_id, BatchStatus::Completed)?;
            if reg.batch(batch_id)?.all_items_settled() {
                reg.retire_batch(batch_id, "completed")?;
            }
            Ok(())
        })
    }

    /// Retire a failed batch: items under the retry bound re-enter a
    /// collecting batch of the same kind with their descriptions intact,
    /// the rest are errored permanently.
    fn fail_batch(&self, batch_id: BatchId, reason: &str, summary: &mut RunSummary) -> Result<()> {
        let (requeued, errored) = self.store.with_lock(|reg| {
            let kind = reg.batch(batch_id)?.kind.clone();
            let mut requeue_keys = Vec::new();
            let mut errored = Vec::new();
            let batch = reg.batch_mut(batch_id)?;
            for (key, entry) in batch.items.iter_mut() {
                if entry.status.is_terminal() {
                    continue;
                }
                entry.retries += 1;
                if entry.retries <= self.config.max_item_retries {
                    entry.status = ItemStatus::Pending;
                    entry.error = Some(reason.to_string());
                    entry.result = None;
                    requeue_keys.push(key.clone());
                } else {
                    let message = format!("retry limit exceeded: {reason}");
                    entry.mark_error(message.clone());
                    errored.push((key.clone(), message));
                }
            }
            if !requeue_keys.is_empty() {
                let target = reg
                    .collecting_batch_for(&kind)
                    .unwrap_or_else(|| reg.create_batch(kind.clone()));
                reg.move_items(batch_id, target, &requeue_keys)?;
            }
            reg.retire_batch(batch_id, reason)?;
            Ok((requeue_keys.len(), errored))
        })?;
        tracing::warn!(batch = %batch_id, %reason, requeued, errored = errored.len(), "batch retired after failure");
        summary.errored += errored.len();
        summary.error_reasons.extend(errored);
        Ok(())
    }

    // ---- phase 2: send ----------------------------------------------------

    async fn phase_send(&self, summary: &mut RunSummary) -> Result<()> {
        let mut queue: VecDeque<BatchId> = self
            .store
            .load()?
            .active_batches(Some(BatchStatus::Ready))
            .into_iter()
            .map(|b| b.id)
            .collect();

        while let Some(batch_id) = queue.pop_front() {
            let today = date_key(Utc::now());
            let daily = self.store.load()?.daily_count(&today);
            if daily >= self.config.daily_submission_limit {
                tracing::warn!(
                    date = %today,
                    submitted = daily,
                    limit = self.config.daily_submission_limit,
                    "daily submission quota reached, deferring remaining batches"
                );
                return Ok(());
            }

            let (payload, estimate_items) = self.build_payload(batch_id)?;
            if payload.is_empty() {
                self.store
                    .with_lock(|reg| reg.retire_batch(batch_id, "no submittable items"))?;
                continue;
            }

            let artifacts = self.store.artifacts(batch_id)?;
            artifacts.write_payload(&payload)?;
            let estimate = self.estimator.estimate(&estimate_items);
            artifacts.write_estimate(&CostRecord {
                estimated_input_units: estimate.input_units,
                estimated_output_units: estimate.output_units,
                estimated_cost: estimate.cost,
                actual_cost: None,
                estimated_at: Utc::now(),
            })?;
            tracing::info!(
                batch = %batch_id,
                items = payload.len(),
                input_units = estimate.input_units,
                cost_usd = estimate.cost,
                "submitting batch"
            );

            if !self.submit_with_retry(batch_id, &payload, &mut queue, summary).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Submit one batch. Returns `Ok(false)` when the phase should stop for
    /// this run (rate limit or persistent network failure).
    async fn submit_with_retry(
        &self,
        batch_id: BatchId,
        payload: &[JobItem],
        queue: &mut VecDeque<BatchId>,
        summary: &mut RunSummary,
    ) -> Result<bool> {
        let mut attempt = 0u32;
        loop {
            match self.client.submit(payload).await {
                Ok(job_id) => {
                    self.mark_sent(batch_id, &job_id)?;
                    summary.submitted_batches += 1;
                    return Ok(true);
                }
                Err(SubmitError::SizeExceeded) if payload.len() > 1 => {
                    let halves = self.split_batch(batch_id)?;
                    tracing::info!(
                        batch = %batch_id,
                        first = %halves.0,
                        second = %halves.1,
                        "payload too large, split into two batches"
                    );
                    queue.push_front(halves.1);
                    queue.push_front(halves.0);
                    return Ok(true);
                }
                Err(SubmitError::SizeExceeded) => {
                    // A single item that cannot fit will never fit.
                    let key = self.store.with_lock(|reg| {
                        let key = reg
                            .batch_mut(batch_id)?
                            .items
                            .values_mut()
                            .find(|e| e.status == ItemStatus::DescriptionSaved)
                            .map(|entry| {
                                entry.mark_error("single item exceeds the service size limit");
                                entry.identity.key()
                            });
                        reg.retire_batch(batch_id, "oversize item")?;
                        Ok(key)
                    })?;
                    if let Some(key) = key {
                        summary
                            .error_reasons
                            .push((key, "single item exceeds the service size limit".to_string()));
                    }
                    summary.errored += 1;
                    return Ok(true);
                }
                Err(e @ SubmitError::NetworkTimeout(_)) => {
                    attempt += 1;
                    if attempt >= self.config.send_max_attempts {
                        tracing::warn!(batch = %batch_id, error = %e, "network failures exhausted retries, deferring batch");
                        return Ok(false);
                    }
                    let delay = self.config.backoff_delay(attempt - 1);
                    tracing::warn!(batch = %batch_id, error = %e, attempt, delay_ms = delay.as_millis() as u64, "submit failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(SubmitError::RateLimited) => {
                    tracing::warn!(batch = %batch_id, "rate limited, deferring remaining batches");
                    return Ok(false);
                }
                Err(e @ SubmitError::AuthFailed(_)) => {
                    return Err(VolleyError::Submit(e));
                }
                Err(e @ SubmitError::Unknown(_)) => {
                    self.fail_batch(batch_id, &e.to_string(), summary)?;
                    return Ok(true);
                }
            }
        }
    }

    fn build_payload(&self, batch_id: BatchId) -> Result<(Vec<JobItem>, Vec<EstimateItem>)> {
        let registry = self.store.load()?;
        let batch = registry.batch(batch_id)?;
        let mut payload = Vec::new();
        let mut estimate_items = Vec::new();
        for entry in batch.items_with_status(ItemStatus::DescriptionSaved) {
            let Some(custom_id) = entry.external_request_id.clone() else {
                continue;
            };
            payload.push(JobItem {
                custom_id,
                body: self.build_request_body(entry),
            });
            estimate_items.push(EstimateItem {
                description_chars: entry.description.as_deref().map_or(0, str::len),
                image_dims: entry.image_dims,
            });
        }
        Ok((payload, estimate_items))
    }

    fn build_request_body(&self, entry: &ItemEntry) -> serde_json::Value {
        json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": entry.description.as_deref().unwrap_or_default()},
            ],
            "response_format": {"type": "json_object"},
            "max_tokens": self.config.cost.output_units_per_item * 2,
        })
    }

    fn mark_sent(&self, batch_id: BatchId, job_id: &str) -> Result<()> {
        self.store.with_lock(|reg| {
            reg.set_batch_status(batch_id, BatchStatus::Sent)?;
            let batch = reg.batch_mut(batch_id)?;
            batch.external_job_id = Some(job_id.to_string());
            for entry in batch.items.values_mut() {
                if entry.status == ItemStatus::DescriptionSaved {
                    entry.status = ItemStatus::Submitted;
                }
            }
            reg.increment_daily(&date_key(Utc::now()));
            Ok(())
        })
    }

    /// Split a ready batch into two ready halves, retiring the original.
    fn split_batch(&self, batch_id: BatchId) -> Result<(BatchId, BatchId)> {
        self.store.with_lock(|reg| {
            let kind = reg.batch(batch_id)?.kind.clone();
            let keys: Vec<String> = reg.batch(batch_id)?.items.keys().cloned().collect();
            let mid = keys.len() / 2;
            let mut halves = Vec::with_capacity(2);
            for chunk in [&keys[..mid], &keys[mid..]] {
                let half = reg.create_batch(kind.clone());
                reg.move_items(batch_id, half, chunk)?;
                reg.set_batch_status(half, BatchStatus::Ready)?;
                halves.push(half);
            }
            reg.retire_batch(batch_id, "size split")?;
            Ok((halves[0], halves[1]))
        })
    }

    // ---- phase 3: collect -------------------------------------------------

    fn phase_collect(&self, summary: &mut RunSummary) -> Result<()> {
        let mut kinds = vec![ItemKind::Original];
        kinds.extend(
            self.config
                .variant_tags
                .iter()
                .map(|t| ItemKind::Variant(t.clone())),
        );

        // Items requeued from failed batches keep their description and skip
        // re-acquisition.
        self.store.with_lock(|reg| {
            let collecting: Vec<BatchId> = reg
                .active_batches(Some(BatchStatus::Collecting))
                .into_iter()
                .map(|b| b.id)
                .collect();
            for id in collecting {
                let min = self.config.min_description_len;
                let promoted = promote_described_items(reg.batch_mut(id)?, min);
                if promoted > 0 {
                    tracing::info!(batch = %id, promoted, "requeued items promoted without re-prompting");
                }
            }
            Ok(())
        })?;

        let mut collected = 0usize;
        'kinds: for kind in kinds {
            let registry = self.store.load()?;
            let candidates = self.eligible_candidates(&registry, &kind)?;
            if candidates.is_empty() {
                continue;
            }
            let total = candidates.len();
            tracing::info!(kind = %kind, candidates = total, "collecting items");

            let mut batch_id = self.store.with_lock(|reg| {
                Ok(reg
                    .collecting_batch_for(&kind)
                    .unwrap_or_else(|| reg.create_batch(kind.clone())))
            })?;

            for (index, identity) in candidates.into_iter().enumerate() {
                if collected >= self.config.max_collect_per_run {
                    tracing::info!(limit = self.config.max_collect_per_run, "per-run collection limit reached");
                    break 'kinds;
                }
                let progress = format!("{}/{}", index + 1, total);
                match self.descriptions.acquire(&identity, &progress)? {
                    AcquireOutcome::Save(text) => {
                        let text = text.trim().to_string();
                        if text.len() < self.config.min_description_len {
                            tracing::warn!(
                                item = %identity,
                                len = text.len(),
                                min = self.config.min_description_len,
                                "description too short, leaving item for a later run"
                            );
                            continue;
                        }
                        batch_id = self.claim_described(batch_id, &kind, identity, text)?;
                        collected += 1;
                    }
                    AcquireOutcome::Skip => continue,
                    AcquireOutcome::Reject => {
                        mark_rejected(self.records.as_ref(), &identity)?;
                    }
                }
            }
        }
        summary.collected_items = collected;

        // Finalize whatever was gathered so the next run can send it.
        self.store.with_lock(|reg| {
            let nonempty: Vec<BatchId> = reg
                .active_batches(Some(BatchStatus::Collecting))
                .into_iter()
                .filter(|b| b.item_count() > 0)
                .map(|b| b.id)
                .collect();
            for id in nonempty {
                reg.set_batch_status(id, BatchStatus::Ready)?;
            }
            Ok(())
        })
    }

    /// Unowned unprocessed records of a kind. Derived kinds additionally
    /// require their source item to be fully processed and not in flight.
    fn eligible_candidates(
        &self,
        registry: &Registry,
        kind: &ItemKind,
    ) -> Result<Vec<ItemIdentity>> {
        let unowned = filter_unowned(&self.store, self.records.list_unprocessed(kind)?)?;
        let mut eligible = Vec::new();
        for identity in unowned {
            if kind.is_derived() {
                let Some(record) = self.records.load_record(&identity)? else {
                    continue;
                };
                let Some(source) = record.source else {
                    tracing::warn!(item = %identity, "derived record has no source item, skipping");
                    continue;
                };
                if registry.is_owned(&source) {
                    continue;
                }
                let prerequisite_done = self
                    .records
                    .load_record(&source)?
                    .is_some_and(|r| !r.is_unprocessed());
                if !prerequisite_done {
                    continue;
                }
            }
            eligible.push(identity);
        }
        Ok(eligible)
    }

    /// Claim a described item into the collecting batch, rolling to a fresh
    /// batch when the ceiling is reached.
    fn claim_described(
        &self,
        batch_id: BatchId,
        kind: &ItemKind,
        identity: ItemIdentity,
        description: String,
    ) -> Result<BatchId> {
        self.store.with_lock(|reg| {
            let record = self.records.load_record(&identity)?;
            let mut entry = ItemEntry::new(identity);
            entry.status = ItemStatus::DescriptionSaved;
            entry.description = Some(description);
            if let Some(record) = record {
                entry.image_dims = record.image_dims;
                entry.source = record.source;
            }
            reg.claim_item(batch_id, entry)?;

            if reg.batch(batch_id)?.item_count() >= self.config.batch_ceiling {
                reg.set_batch_status(batch_id, BatchStatus::Ready)?;
                let next = reg.create_batch(kind.clone());
                tracing::info!(full = %batch_id, next = %next, "batch ceiling reached");
                Ok(next)
            } else {
                Ok(batch_id)
            }
        })
    }

    // ---- waiting and status -----------------------------------------------

    /// Poll in-flight batches until none remain or the timeout elapses.
    async fn wait_for_inflight(
        &self,
        timeout: std::time::Duration,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = self
                .store
                .load()?
                .active_batches(Some(BatchStatus::Sent))
                .len();
            if remaining == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(remaining, "wait timeout elapsed with batches still in flight");
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval()).await;
            self.phase_retrieve(summary).await?;
        }
    }

    /// Human-readable lines describing every active batch, with a rough
    /// completion estimate for batches in flight.
    pub async fn status_lines(&self) -> Result<Vec<String>> {
        let registry = self.store.load()?;
        let batches = registry.active_batches(None);
        if batches.is_empty() {
            return Ok(vec!["No active batches.".to_string()]);
        }
        let mut lines = Vec::with_capacity(batches.len());
        for batch in batches {
            let mut line = format_batch_line(batch);
            if batch.status == BatchStatus::Sent {
                if let Some(job_id) = &batch.external_job_id {
                    match self.client.poll_status(job_id).await {
                        Ok(JobStatus::InProgress { completed, total }) => {
                            let remaining = total.saturating_sub(completed);
                            let eta = remaining as u64 * self.config.est_secs_per_item;
                            line.push_str(&format!(
                                ", {completed}/{total} done, ~{eta}s remaining"
                            ));
                        }
                        Ok(status) => line.push_str(&format!(", job {status:?}")),
                        Err(e) => line.push_str(&format!(", status unavailable ({e})")),
                    }
                }
            }
            lines.push(line);
        }
        Ok(lines)
    }
}

fn format_batch_line(batch: &BatchRecord) -> String {
    format!(
        "{} {} {} {} item(s)",
        batch.id,
        batch.kind,
        batch.status,
        batch.item_count()
    )
}

/// Status lines from the registry alone, without polling the service.
/// Used when no service credentials are available.
pub fn local_status_lines(store: &RegistryStore) -> Result<Vec<String>> {
    let registry = store.load()?;
    let batches = registry.active_batches(None);
    if batches.is_empty() {
        return Ok(vec!["No active batches.".to_string()]);
    }
    Ok(batches.into_iter().map(format_batch_line).collect())
}
