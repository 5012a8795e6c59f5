// Pipeline configuration. Passed explicitly to every component that needs it.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of micro-batches each global batch is split into.
    /// `None` falls back to a single micro-batch.
    pub num_micro_batches: Option<u32>,

    /// Upper bound on the per-device memory a compiled stage may use, in bytes.
    /// `None` disables the check.
    pub memory_budget_per_device: Option<u64>,

    /// Dispatch the tasks of one clock tick concurrently instead of serially.
    /// Default: true.
    pub concurrent_dispatch: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_micro_batches: None,
            memory_budget_per_device: None,
            concurrent_dispatch: true,
        }
    }
}

impl PipelineConfig {
    /// Reject values that can never produce a runnable pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.num_micro_batches == Some(0) {
            return Err(TypesError::Config(
                "num_micro_batches must be at least 1".into(),
            ));
        }
        if self.memory_budget_per_device == Some(0) {
            return Err(TypesError::Config(
                "memory_budget_per_device must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
