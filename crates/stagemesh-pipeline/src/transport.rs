//! PipelinePlan encode/decode helpers.
//!
//! Plans are serialized with bincode's standard config so the node binary
//! can write them to disk and inspect them later.

use stagemesh_types::PipelinePlan;

use crate::error::{PipelineError, Result};

/// Encode a [`PipelinePlan`] to bytes.
pub fn encode_plan(plan: &PipelinePlan) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(plan, bincode::config::standard())
        .map_err(|e| PipelineError::Serialization(e.to_string()))
}

/// Decode a [`PipelinePlan`] from bytes produced by [`encode_plan`].
pub fn decode_plan(data: &[u8]) -> Result<PipelinePlan> {
    let (plan, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| PipelineError::Serialization(e.to_string()))?;
    Ok(plan)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use stagemesh_types::{StagePlan, TaskSlot};

    fn plan() -> PipelinePlan {
        PipelinePlan {
            pipeline_id: "p-1".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            num_micro_batches: 2,
            num_meshes: 1,
            stages: vec![StagePlan {
                stage_index: 0,
                name: "layer_0".into(),
                mesh_index: 0,
                invars: vec!["x".into()],
                outvars: vec!["h".into()],
                donation: vec![true],
                memory_per_device: 128,
            }],
            ticks: vec![
                vec![Some(TaskSlot { stage_index: 0, micro_batch_index: 0 })],
                vec![Some(TaskSlot { stage_index: 0, micro_batch_index: 1 })],
                vec![None],
            ],
        }
    }

    #[test]
    fn plan_round_trip() {
        let p = plan();
        let bytes = encode_plan(&p).unwrap();
        assert_eq!(decode_plan(&bytes).unwrap(), p);
    }

    #[test]
    fn truncated_bytes_fail() {
        let bytes = encode_plan(&plan()).unwrap();
        let err = decode_plan(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, PipelineError::Serialization(_)));
    }
}
