// Serializable snapshot of a compiled pipeline, for diagnostics and
// benchmarking. Produced by `stagemesh-pipeline`, consumed by the node binary.

use serde::{Deserialize, Serialize};

// ── Task Slot ─────────────────────────────────────────────────────────────────

/// One occupied cell of the tick table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSlot {
    pub stage_index: u32,
    pub micro_batch_index: u32,
}

// ── Stage Plan ────────────────────────────────────────────────────────────────

/// Compiled stage as seen from outside the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    pub stage_index: u32,
    pub name: String,
    pub mesh_index: u32,
    pub invars: Vec<String>,
    pub outvars: Vec<String>,
    /// Parallel to `invars`: true if the stage may reuse that input's buffer.
    pub donation: Vec<bool>,
    pub memory_per_device: u64,
}

impl StagePlan {
    pub fn donated_invars(&self) -> impl Iterator<Item = &str> {
        self.invars
            .iter()
            .zip(&self.donation)
            .filter(|(_, d)| **d)
            .map(|(v, _)| v.as_str())
    }
}

// ── Pipeline Plan ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub pipeline_id: String,
    pub created_at: String,
    pub num_micro_batches: u32,
    pub num_meshes: u32,
    pub stages: Vec<StagePlan>,
    /// `ticks[t][m]` is the task mesh `m` runs at clock tick `t`.
    pub ticks: Vec<Vec<Option<TaskSlot>>>,
}

impl PipelinePlan {
    pub fn num_ticks(&self) -> usize {
        self.ticks.len()
    }

    /// Fraction of (tick, mesh) cells that carry a task.
    pub fn utilization(&self) -> f64 {
        let total = self.ticks.len() * self.num_meshes as usize;
        if total == 0 {
            return 0.0;
        }
        let busy = self.ticks.iter().flatten().filter(|t| t.is_some()).count();
        busy as f64 / total as f64
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> PipelinePlan {
        PipelinePlan {
            pipeline_id: "p-1".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            num_micro_batches: 1,
            num_meshes: 1,
            stages: vec![StagePlan {
                stage_index: 0,
                name: "layer_0".into(),
                mesh_index: 0,
                invars: vec!["x".into(), "w".into()],
                outvars: vec!["y".into()],
                donation: vec![true, false],
                memory_per_device: 64,
            }],
            ticks: vec![
                vec![Some(TaskSlot { stage_index: 0, micro_batch_index: 0 })],
                vec![None],
            ],
        }
    }

    #[test]
    fn donated_invars_filter() {
        let p = plan();
        let donated: Vec<&str> = p.stages[0].donated_invars().collect();
        assert_eq!(donated, vec!["x"]);
    }

    #[test]
    fn utilization_counts_busy_cells() {
        assert!((plan().utilization() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn pipeline_plan_serde() {
        let p = plan();
        let json = serde_json::to_string(&p).unwrap();
        let round: PipelinePlan = serde_json::from_str(&json).unwrap();
        assert_eq!(round, p);
    }
}
