//! Orchestrator configuration.

use std::time::Duration;

use crate::estimate::CostConfig;

/// Tunables for one orchestrator run.
///
/// Defaults are conservative: small batches, a bounded daily quota, and
/// capped retries.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model name placed in every request body.
    pub model: String,
    /// Items per batch before it is finalized to `ready`.
    pub batch_ceiling: usize,
    /// Minimum accepted description length in characters.
    pub min_description_len: usize,
    /// Failed submission cycles before an item is errored permanently.
    pub max_item_retries: u32,
    /// Batches submitted per UTC day.
    pub daily_submission_limit: u32,
    /// New items collected per run, across all batches.
    pub max_collect_per_run: usize,
    /// Submission attempts per batch before giving up for this run.
    pub send_max_attempts: u32,
    /// Base backoff between submission attempts.
    pub backoff_ms: u64,
    /// Multiplier applied per attempt.
    pub backoff_factor: u64,
    /// Ceiling on the computed backoff.
    pub max_backoff_ms: u64,
    /// Interval between status polls while waiting on sent batches.
    pub poll_interval_ms: u64,
    /// Bound on waiting for in-flight batches; `None` skips the wait phase.
    pub wait_timeout: Option<Duration>,
    /// Days to keep retired batches and their artifacts.
    pub retention_days: i64,
    /// Rough per-item processing estimate used in status output.
    pub est_secs_per_item: u64,
    /// Variant tags collected after originals, in order.
    pub variant_tags: Vec<String>,
    pub cost: CostConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            batch_ceiling: 20,
            min_description_len: 20,
            max_item_retries: 3,
            daily_submission_limit: 35,
            max_collect_per_run: 100,
            send_max_attempts: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 10_000,
            poll_interval_ms: 30_000,
            wait_timeout: None,
            retention_days: 30,
            est_secs_per_item: 30,
            variant_tags: Vec::new(),
            cost: CostConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Exponential backoff delay for the given zero-based attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt);
        let ms = self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(config.backoff_delay(10), Duration::from_millis(10_000));
    }
}
