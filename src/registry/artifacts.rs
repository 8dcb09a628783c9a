//! Per-batch artifact directory: submitted payload, raw results, cost record.
//!
//! Artifacts are debugging and audit material, not orchestration state. They
//! live under `<state_dir>/batches/<batch_id>/` and are deleted when the
//! retired batch ages past the retention window.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::{JobItem, JobResult};
use crate::error::Result;

use super::write_json_atomic;

const PAYLOAD_FILE: &str = "payload.json";
const RESULTS_FILE: &str = "results.json";
const COSTS_FILE: &str = "costs.json";

/// Cost record written alongside a batch at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub estimated_input_units: u64,
    pub estimated_output_units: u64,
    pub estimated_cost: f64,
    /// Filled in after completion if the provider reports real usage.
    pub actual_cost: Option<f64>,
    pub estimated_at: DateTime<Utc>,
}

/// Raw result row as persisted to the results artifact.
#[derive(Debug, Serialize, Deserialize)]
struct ResultRow {
    custom_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Handle on one batch's artifact directory.
pub struct BatchArtifacts {
    dir: PathBuf,
}

impl BatchArtifacts {
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Persist the exact payload handed to the submission client.
    pub fn write_payload(&self, items: &[JobItem]) -> Result<()> {
        write_json_atomic(&self.dir.join(PAYLOAD_FILE), &items)
    }

    /// Persist the raw results fetched for this batch.
    pub fn write_results(&self, results: &[JobResult]) -> Result<()> {
        let rows: Vec<ResultRow> = results
            .iter()
            .map(|r| match &r.payload {
                Ok(payload) => ResultRow {
                    custom_id: r.custom_id.clone(),
                    payload: Some(payload.clone()),
                    error: None,
                },
                Err(reason) => ResultRow {
                    custom_id: r.custom_id.clone(),
                    payload: None,
                    error: Some(reason.clone()),
                },
            })
            .collect();
        write_json_atomic(&self.dir.join(RESULTS_FILE), &rows)
    }

    /// Persist the submission-time cost estimate.
    pub fn write_estimate(&self, record: &CostRecord) -> Result<()> {
        write_json_atomic(&self.dir.join(COSTS_FILE), record)
    }

    /// Record the provider-reported cost after completion, keeping the
    /// original estimate for comparison.
    pub fn record_actual_cost(&self, actual: f64) -> Result<()> {
        let path = self.dir.join(COSTS_FILE);
        let mut record: CostRecord = serde_json::from_slice(&fs::read(&path)?)?;
        record.actual_cost = Some(actual);
        write_json_atomic(&path, &record)
    }
}
