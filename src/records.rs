//! Downstream record store: where reconciled results land.
//!
//! A record is the per-item metadata document the rest of the pipeline
//! consumes. Reconciliation only ever fills fields that are still at their
//! unprocessed sentinel value, so re-running a batch can never clobber data
//! written by a previous run or edited by hand.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::item::{ItemIdentity, ItemKind};
use crate::error::Result;
use crate::registry::write_json_atomic;

const MAX_TITLE_CHARS: usize = 200;
const MAX_DESCRIPTION_CHARS: usize = 2000;

/// Per-channel processing status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Sentinel: never filled by any run.
    Unprocessed,
    /// Filled by reconciliation.
    Prepared,
    /// Operator rejected the item; it is never collected again.
    Rejected,
}

/// Generated fields extracted from one result payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedFields {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// One downstream record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub kind: ItemKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub prepared_at: Option<DateTime<Utc>>,
    /// Status per output channel. All channels start unprocessed.
    pub channels: BTreeMap<String, RecordStatus>,
    /// Prerequisite item for derived kinds.
    #[serde(default)]
    pub source: Option<ItemIdentity>,
    /// Image dimensions, if known.
    #[serde(default)]
    pub image_dims: Option<(u32, u32)>,
}

impl Record {
    pub fn new(kind: ItemKind, channels: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind,
            title: String::new(),
            description: String::new(),
            keywords: Vec::new(),
            prepared_at: None,
            channels: channels
                .into_iter()
                .map(|c| (c, RecordStatus::Unprocessed))
                .collect(),
            source: None,
            image_dims: None,
        }
    }

    /// True if any channel is still at the unprocessed sentinel.
    pub fn is_unprocessed(&self) -> bool {
        self.channels
            .values()
            .any(|s| *s == RecordStatus::Unprocessed)
    }

    pub fn is_rejected(&self) -> bool {
        self.channels.values().all(|s| *s == RecordStatus::Rejected)
    }

    /// Apply generated fields, flipping only `unprocessed` channels to
    /// `prepared`. Channels already prepared or rejected are untouched, and
    /// field values are only written when every touched channel was still at
    /// the sentinel, keeping the operation idempotent.
    pub fn apply(&mut self, fields: &GeneratedFields) -> bool {
        if !self.is_unprocessed() {
            return false;
        }
        self.title = truncate_chars(&fields.title, MAX_TITLE_CHARS);
        self.description = truncate_chars(&fields.description, MAX_DESCRIPTION_CHARS);
        self.keywords = fields.keywords.clone();
        self.prepared_at = Some(Utc::now());
        for status in self.channels.values_mut() {
            if *status == RecordStatus::Unprocessed {
                *status = RecordStatus::Prepared;
            }
        }
        true
    }

    /// Mark every remaining unprocessed channel rejected.
    pub fn reject(&mut self) {
        for status in self.channels.values_mut() {
            if *status == RecordStatus::Unprocessed {
                *status = RecordStatus::Rejected;
            }
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Storage for downstream records.
///
/// Object-safe and synchronous: the registry store is the only component
/// with real concurrency pressure, and record saves always happen inside a
/// registry lock anyway.
pub trait RecordStore: Send + Sync {
    fn load_record(&self, identity: &ItemIdentity) -> Result<Option<Record>>;
    fn save_record(&self, identity: &ItemIdentity, record: &Record) -> Result<()>;
    /// Identities whose record has at least one unprocessed channel, for the
    /// given kind.
    fn list_unprocessed(&self, kind: &ItemKind) -> Result<Vec<ItemIdentity>>;
}

/// Reject a record in place, creating nothing if it does not exist.
pub fn mark_rejected(store: &dyn RecordStore, identity: &ItemIdentity) -> Result<()> {
    if let Some(mut record) = store.load_record(identity)? {
        record.reject();
        store.save_record(identity, &record)?;
        tracing::info!(item = %identity, "record rejected by operator");
    }
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordsDocument {
    records: BTreeMap<String, StoredRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    identity: ItemIdentity,
    record: Record,
}

/// JSON-file-backed record store.
pub struct JsonRecordStore {
    path: PathBuf,
    mutex: Mutex<()>,
}

impl JsonRecordStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            mutex: Mutex::new(()),
        })
    }

    fn load_doc(&self) -> Result<RecordsDocument> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RecordsDocument::default()),
            Err(e) => Err(e.into()),
        }
    }
}

impl RecordStore for JsonRecordStore {
    fn load_record(&self, identity: &ItemIdentity) -> Result<Option<Record>> {
        let _guard = self.mutex.lock();
        Ok(self
            .load_doc()?
            .records
            .get(&identity.key())
            .map(|s| s.record.clone()))
    }

    fn save_record(&self, identity: &ItemIdentity, record: &Record) -> Result<()> {
        let _guard = self.mutex.lock();
        let mut doc = self.load_doc()?;
        doc.records.insert(
            identity.key(),
            StoredRecord {
                identity: identity.clone(),
                record: record.clone(),
            },
        );
        write_json_atomic(&self.path, &doc)
    }

    fn list_unprocessed(&self, kind: &ItemKind) -> Result<Vec<ItemIdentity>> {
        let _guard = self.mutex.lock();
        let doc = self.load_doc()?;
        Ok(doc
            .records
            .values()
            .filter(|s| &s.record.kind == kind && s.record.is_unprocessed())
            .map(|s| s.identity.clone())
            .collect())
    }
}

/// In-memory record store for tests.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<String, (ItemIdentity, Record)>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, identity: ItemIdentity, record: Record) {
        self.records
            .lock()
            .insert(identity.key(), (identity, record));
    }

    pub fn remove(&self, identity: &ItemIdentity) {
        self.records.lock().remove(&identity.key());
    }
}

impl RecordStore for InMemoryRecordStore {
    fn load_record(&self, identity: &ItemIdentity) -> Result<Option<Record>> {
        Ok(self
            .records
            .lock()
            .get(&identity.key())
            .map(|(_, r)| r.clone()))
    }

    fn save_record(&self, identity: &ItemIdentity, record: &Record) -> Result<()> {
        self.records
            .lock()
            .insert(identity.key(), (identity.clone(), record.clone()));
        Ok(())
    }

    fn list_unprocessed(&self, kind: &ItemKind) -> Result<Vec<ItemIdentity>> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|(_, r)| &r.kind == kind && r.is_unprocessed())
            .map(|(i, _)| i.clone())
            .collect())
    }
}
