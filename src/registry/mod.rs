//! Durable, crash-safe registry of batches and the global item exclusion index.
//!
//! The registry is the single source of truth for the orchestrator. Every
//! mutation goes through [`RegistryStore::with_lock`], which loads the
//! document, applies the mutation, and rewrites it atomically
//! (write-to-temp then rename) so readers never observe a partial file.
//!
//! A registry file that exists but cannot be parsed is a fatal error:
//! silently resetting state would re-submit already-billed work.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::batch::{BatchId, BatchRecord, BatchStatus, RetiredBatch};
use crate::domain::item::{ItemEntry, ItemIdentity, ItemKind, ItemStatus};
use crate::error::{Result, VolleyError};

pub mod artifacts;

pub use artifacts::{BatchArtifacts, CostRecord};

const REGISTRY_VERSION: u32 = 1;
const REGISTRY_FILE: &str = "registry.json";

/// UTC date key used for the rolling daily submission quota.
pub fn date_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// The registry document: active batches, the item exclusion index,
/// the retired-batch log, and daily submission counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub version: u32,
    /// Active batches (anything not yet retired).
    pub batches: BTreeMap<BatchId, BatchRecord>,
    /// Exclusion index: item identity key -> owning batch id.
    pub owners: BTreeMap<String, BatchId>,
    /// Retired batches, purged after the retention window.
    pub retired: Vec<RetiredBatch>,
    /// Batches submitted per UTC day, for the daily quota.
    pub daily_submissions: BTreeMap<String, u32>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            batches: BTreeMap::new(),
            owners: BTreeMap::new(),
            retired: Vec::new(),
            daily_submissions: BTreeMap::new(),
        }
    }
}

impl Registry {
    pub fn batch(&self, id: BatchId) -> Result<&BatchRecord> {
        self.batches.get(&id).ok_or(VolleyError::BatchNotFound(id))
    }

    pub fn batch_mut(&mut self, id: BatchId) -> Result<&mut BatchRecord> {
        self.batches
            .get_mut(&id)
            .ok_or(VolleyError::BatchNotFound(id))
    }

    /// Active batches, optionally filtered by status, ordered originals
    /// first, then by creation time.
    pub fn active_batches(&self, status: Option<BatchStatus>) -> Vec<&BatchRecord> {
        let mut batches: Vec<&BatchRecord> = self
            .batches
            .values()
            .filter(|b| status.is_none() || status == Some(b.status))
            .collect();
        batches.sort_by_key(|b| (b.kind.is_derived(), b.created_at, b.id));
        batches
    }

    /// The open collecting batch for a kind, if any.
    pub fn collecting_batch_for(&self, kind: &ItemKind) -> Option<BatchId> {
        self.batches
            .values()
            .find(|b| b.status == BatchStatus::Collecting && &b.kind == kind)
            .map(|b| b.id)
    }

    /// Create a new collecting batch of the given kind.
    pub fn create_batch(&mut self, kind: ItemKind) -> BatchId {
        let batch = BatchRecord::new(kind);
        let id = batch.id;
        self.batches.insert(id, batch);
        id
    }

    /// Advance a batch's status. Backward and skipping transitions are
    /// rejected; the status sequence is monotonic.
    pub fn set_batch_status(&mut self, id: BatchId, next: BatchStatus) -> Result<()> {
        let batch = self.batch_mut(id)?;
        if !batch.status.can_advance_to(next) {
            return Err(VolleyError::InvalidTransition {
                batch: id,
                from: batch.status,
                to: next,
            });
        }
        tracing::debug!(batch = %id, from = %batch.status, to = %next, "batch transition");
        batch.status = next;
        Ok(())
    }

    /// Owning batch of an item: an active batch (`collecting | ready |
    /// sent`), or a retired batch that still holds the item because it
    /// errored permanently.
    pub fn owner_of(&self, identity: &ItemIdentity) -> Option<BatchId> {
        let id = self.owners.get(&identity.key())?;
        match self.batches.get(id) {
            Some(batch) => batch.status.owns_items().then_some(*id),
            // Only permanently errored items keep their index entry past
            // retirement; the hold lasts until the retired batch is purged.
            None => Some(*id),
        }
    }

    /// True if the item is owned by an active batch.
    pub fn is_owned(&self, identity: &ItemIdentity) -> bool {
        self.owner_of(identity).is_some()
    }

    /// Claim an item into a batch, assigning its per-job request id and
    /// registering it in the exclusion index.
    ///
    /// An item may belong to at most one active batch; claiming an item
    /// owned elsewhere is an error.
    pub fn claim_item(&mut self, batch_id: BatchId, mut entry: ItemEntry) -> Result<()> {
        let key = entry.identity.key();
        if let Some(owner) = self.owner_of(&entry.identity) {
            if owner != batch_id {
                return Err(VolleyError::ItemAlreadyOwned {
                    identity: key,
                    batch: owner,
                });
            }
        }
        let batch = self.batch_mut(batch_id)?;
        entry.external_request_id = Some(batch.next_request_id());
        batch.items.insert(key.clone(), entry);
        self.owners.insert(key, batch_id);
        Ok(())
    }

    /// Move items (by identity key) from one batch to another, reassigning
    /// request ids and ownership. Used for size splits and failure requeues.
    pub fn move_items(&mut self, from: BatchId, to: BatchId, keys: &[String]) -> Result<()> {
        for key in keys {
            let entry = self
                .batch_mut(from)?
                .items
                .remove(key)
                .ok_or_else(|| VolleyError::ItemNotFound {
                    batch: from,
                    identity: key.clone(),
                })?;
            let target = self.batch_mut(to)?;
            let mut entry = entry;
            entry.external_request_id = Some(target.next_request_id());
            target.items.insert(key.clone(), entry);
            self.owners.insert(key.clone(), to);
        }
        Ok(())
    }

    /// Retire a batch: remove it from the active set, release its items
    /// from the exclusion index, and append it to the retired log.
    ///
    /// Permanently errored items keep their exclusion-index entry so they
    /// are not re-collected as fresh items with a reset retry counter; the
    /// hold is released when the retired batch is purged.
    pub fn retire_batch(&mut self, id: BatchId, reason: impl Into<String>) -> Result<()> {
        let batch = self
            .batches
            .remove(&id)
            .ok_or(VolleyError::BatchNotFound(id))?;
        for (key, entry) in &batch.items {
            if self.owners.get(key) == Some(&id) && entry.status != ItemStatus::Error {
                self.owners.remove(key);
            }
        }
        self.retired.push(RetiredBatch {
            id,
            kind: batch.kind,
            retired_at: Utc::now(),
            reason: reason.into(),
            item_count: batch.items.len(),
        });
        Ok(())
    }

    /// Drop retired entries older than the cutoff, returning their ids so
    /// the caller can delete the matching artifact directories. Exclusion
    /// holds left by permanently errored items are released here.
    pub fn purge_retired(&mut self, cutoff: DateTime<Utc>) -> Vec<BatchId> {
        let (purged, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired)
            .into_iter()
            .partition(|r| r.retired_at < cutoff);
        self.retired = kept;
        let purged: Vec<BatchId> = purged.into_iter().map(|r| r.id).collect();
        self.owners.retain(|_, owner| !purged.contains(owner));
        purged
    }

    pub fn daily_count(&self, key: &str) -> u32 {
        self.daily_submissions.get(key).copied().unwrap_or(0)
    }

    pub fn increment_daily(&mut self, key: &str) {
        *self.daily_submissions.entry(key.to_string()).or_insert(0) += 1;
    }
}

/// Serialize a value to a file atomically: write a temp file in the same
/// directory, then rename over the target.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// File-backed registry store.
///
/// All mutations go through [`RegistryStore::with_lock`]. The in-process
/// mutex serializes read-modify-write sequences; cross-process exclusion is
/// the run lease's job ([`crate::guard::RunLease`]).
#[derive(Debug)]
pub struct RegistryStore {
    state_dir: PathBuf,
    registry_path: PathBuf,
    mutex: Mutex<()>,
}

impl RegistryStore {
    /// Open (or initialize) the registry under `state_dir`.
    ///
    /// Fails fast if an existing registry file cannot be parsed.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;
        let store = Self {
            registry_path: state_dir.join(REGISTRY_FILE),
            state_dir,
            mutex: Mutex::new(()),
        };
        // Validate up front so corruption surfaces before any phase runs.
        store.load()?;
        Ok(store)
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Artifact directory for one batch (payload, results, cost record).
    pub fn batch_dir(&self, id: BatchId) -> PathBuf {
        self.state_dir.join("batches").join(id.0.to_string())
    }

    /// Load the registry. A missing file yields an empty registry; an
    /// unparseable file is fatal.
    pub fn load(&self) -> Result<Registry> {
        let data = match fs::read(&self.registry_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Registry::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|source| VolleyError::CorruptRegistry {
            path: self.registry_path.clone(),
            source,
        })
    }

    /// Persist the registry atomically.
    pub fn save(&self, registry: &Registry) -> Result<()> {
        write_json_atomic(&self.registry_path, registry)
    }

    /// Run a read-modify-write sequence under the store lock and flush the
    /// result durably before returning.
    pub fn with_lock<T>(&self, f: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
        let _guard = self.mutex.lock();
        let mut registry = self.load()?;
        let out = f(&mut registry)?;
        self.save(&registry)?;
        Ok(out)
    }

    /// Purge retired batches older than the retention cutoff, deleting
    /// their artifact directories.
    pub fn purge_retired(&self, cutoff: DateTime<Utc>) -> Result<()> {
        let purged = self.with_lock(|reg| Ok(reg.purge_retired(cutoff)))?;
        for id in purged {
            let dir = self.batch_dir(id);
            if dir.exists() {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    tracing::warn!(batch = %id, error = %e, "failed to delete retired batch dir");
                }
            }
        }
        Ok(())
    }

    /// Open the artifact directory for a batch, creating it if needed.
    pub fn artifacts(&self, id: BatchId) -> Result<BatchArtifacts> {
        BatchArtifacts::open(self.batch_dir(id))
    }
}

/// Promote a collecting batch's requeued items: entries that re-entered as
/// `pending` but already carry a valid description skip re-acquisition.
pub fn promote_described_items(batch: &mut BatchRecord, min_len: usize) -> usize {
    let mut promoted = 0;
    for entry in batch.items.values_mut() {
        if entry.status == ItemStatus::Pending
            && entry
                .description
                .as_deref()
                .is_some_and(|d| d.trim().len() >= min_len)
        {
            entry.status = ItemStatus::DescriptionSaved;
            promoted += 1;
        }
    }
    promoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn identity(n: u32) -> ItemIdentity {
        ItemIdentity::new(format!("photos/{n:03}.jpg"), format!("hash{n}"))
    }

    fn described(n: u32) -> ItemEntry {
        let mut entry = ItemEntry::new(identity(n));
        entry.status = ItemStatus::DescriptionSaved;
        entry.description = Some("a reasonably long test description".to_string());
        entry
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();

        let batch_id = store
            .with_lock(|reg| {
                let id = reg.create_batch(ItemKind::Original);
                reg.claim_item(id, described(1))?;
                Ok(id)
            })
            .unwrap();

        let reg = store.load().unwrap();
        assert_eq!(reg.batches.len(), 1);
        assert_eq!(reg.batch(batch_id).unwrap().item_count(), 1);
        assert!(reg.is_owned(&identity(1)));
    }

    #[test]
    fn corrupt_registry_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let store = RegistryStore::open(dir.path()).unwrap();
            store.save(&Registry::default()).unwrap();
        }
        fs::write(dir.path().join(REGISTRY_FILE), b"{ not json").unwrap();

        let err = RegistryStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, VolleyError::CorruptRegistry { .. }));
    }

    #[test]
    fn item_owned_by_one_active_batch_at_most() {
        let mut reg = Registry::default();
        let a = reg.create_batch(ItemKind::Original);
        let b = reg.create_batch(ItemKind::Original);
        reg.claim_item(a, described(1)).unwrap();

        let err = reg.claim_item(b, described(1)).unwrap_err();
        assert!(matches!(err, VolleyError::ItemAlreadyOwned { .. }));

        // Retiring the owner releases the identity for a new claim.
        reg.retire_batch(a, "test").unwrap();
        reg.claim_item(b, described(1)).unwrap();
    }

    #[test]
    fn backward_transitions_rejected() {
        let mut reg = Registry::default();
        let id = reg.create_batch(ItemKind::Original);
        reg.set_batch_status(id, BatchStatus::Ready).unwrap();
        reg.set_batch_status(id, BatchStatus::Sent).unwrap();

        let err = reg.set_batch_status(id, BatchStatus::Ready).unwrap_err();
        assert!(matches!(err, VolleyError::InvalidTransition { .. }));
        assert_eq!(reg.batch(id).unwrap().status, BatchStatus::Sent);
    }

    #[test]
    fn skipping_transitions_rejected() {
        let mut reg = Registry::default();
        let id = reg.create_batch(ItemKind::Original);
        let err = reg.set_batch_status(id, BatchStatus::Sent).unwrap_err();
        assert!(matches!(err, VolleyError::InvalidTransition { .. }));
    }

    #[test]
    fn move_items_reassigns_ownership_and_request_ids() {
        let mut reg = Registry::default();
        let from = reg.create_batch(ItemKind::Original);
        let to = reg.create_batch(ItemKind::Original);
        reg.claim_item(from, described(1)).unwrap();
        let old_rid = reg.batch(from).unwrap().items[&identity(1).key()]
            .external_request_id
            .clone();

        reg.move_items(from, to, &[identity(1).key()]).unwrap();

        assert_eq!(reg.batch(from).unwrap().item_count(), 0);
        assert_eq!(reg.batch(to).unwrap().item_count(), 1);
        assert_eq!(reg.owner_of(&identity(1)), Some(to));
        let new_rid = reg.batch(to).unwrap().items[&identity(1).key()]
            .external_request_id
            .clone();
        assert_ne!(old_rid, new_rid);
    }

    #[test]
    fn permanently_errored_items_stay_held_until_purge() {
        let mut reg = Registry::default();
        let a = reg.create_batch(ItemKind::Original);
        reg.claim_item(a, described(1)).unwrap();
        reg.claim_item(a, described(2)).unwrap();
        reg.batch_mut(a)
            .unwrap()
            .items
            .get_mut(&identity(1).key())
            .unwrap()
            .mark_error("retry limit exceeded");
        reg.retire_batch(a, "failed").unwrap();

        // The errored identity stays excluded, its healthy sibling is freed.
        assert!(reg.is_owned(&identity(1)));
        assert!(!reg.is_owned(&identity(2)));
        let b = reg.create_batch(ItemKind::Original);
        let err = reg.claim_item(b, described(1)).unwrap_err();
        assert!(matches!(err, VolleyError::ItemAlreadyOwned { .. }));

        // Purging the retired batch releases the hold.
        reg.retired[0].retired_at = Utc::now() - chrono::Duration::days(60);
        reg.purge_retired(Utc::now() - chrono::Duration::days(30));
        assert!(!reg.is_owned(&identity(1)));
        reg.claim_item(b, described(1)).unwrap();
    }

    #[test]
    fn purge_retired_honors_cutoff() {
        let mut reg = Registry::default();
        let old = reg.create_batch(ItemKind::Original);
        let recent = reg.create_batch(ItemKind::Original);
        reg.retire_batch(old, "done").unwrap();
        reg.retired[0].retired_at = Utc::now() - chrono::Duration::days(60);
        reg.retire_batch(recent, "done").unwrap();

        let purged = reg.purge_retired(Utc::now() - chrono::Duration::days(30));
        assert_eq!(purged, vec![old]);
        assert_eq!(reg.retired.len(), 1);
        assert_eq!(reg.retired[0].id, recent);
    }

    #[test]
    fn promote_described_skips_short_descriptions() {
        let mut batch = BatchRecord::new(ItemKind::Original);
        let mut with_description = ItemEntry::new(identity(1));
        with_description.description = Some("long enough description text".to_string());
        let mut too_short = ItemEntry::new(identity(2));
        too_short.description = Some("short".to_string());
        batch.items.insert(identity(1).key(), with_description);
        batch.items.insert(identity(2).key(), too_short);

        assert_eq!(promote_described_items(&mut batch, 10), 1);
        assert_eq!(
            batch.items[&identity(1).key()].status,
            ItemStatus::DescriptionSaved
        );
        assert_eq!(batch.items[&identity(2).key()].status, ItemStatus::Pending);
    }
}
