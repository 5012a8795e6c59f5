//! Ready-made training steps for demos and tests.
//!
//! A two-layer MLP with hand-written backward pass, cut into four stages:
//!
//! ```text
//!   layer_0 (mesh 0) ─▶ layer_1 (mesh 1) ─▶ layer_1_bwd (mesh 1) ─▶ layer_0_bwd (mesh 0)
//!                                                                        │
//!                                              grad_barrier ◀────────────┘
//!                                                   │
//!                                             SGD: w -= lr * g
//! ```
//!
//! Some stages read values that were never routed through their markers
//! (the labels, the first activation, the raw input), the way a tracer
//! would emit them.

use stagemesh_types::Tensor;

use crate::builder::TrainStep;
use crate::error::Result;
use crate::graph::{GraphBuilder, Primitive};

pub const MLP_IN: usize = 4;
pub const MLP_HIDDEN: usize = 3;
pub const MLP_OUT: usize = 2;

/// MLP step over `rows` examples. Inputs are `x, y, w1, w2`; outputs are
/// `loss, w1_new, w2_new`. The loss is a sum, so gradients add up across
/// micro-batches.
pub fn mlp_training_step(rows: usize, lr: f32) -> Result<TrainStep> {
    use Primitive::*;

    let mut b = GraphBuilder::new();
    let x = b.input("x", &[rows, MLP_IN])?;
    let y = b.input("y", &[rows, MLP_OUT])?;
    let w1 = b.input("w1", &[MLP_IN, MLP_HIDDEN])?;
    let w2 = b.input("w2", &[MLP_HIDDEN, MLP_OUT])?;

    // Forward, layer 0.
    let s = b.stage_start("layer_0", Some(0), &[&x, &w1]);
    let z1 = b.op(MatMul, &[&s[0], &s[1]])?;
    let h = b.op(Relu, &[&z1])?;
    let e = b.stage_end("layer_0", &[&h, &z1]);
    let (h, z1) = (e[0].clone(), e[1].clone());

    // Forward, layer 1 and the loss. Reads `y` directly.
    let s = b.stage_start("layer_1", Some(1), &[&h, &w2]);
    let p = b.op(MatMul, &[&s[0], &s[1]])?;
    let d = b.op(Sub, &[&p, &y])?;
    let sq = b.op(Mul, &[&d, &d])?;
    let loss = b.op(ReduceSum { axis: None }, &[&sq])?;
    let e = b.stage_end("layer_1", &[&d, &loss]);
    let (d, loss) = (e[0].clone(), e[1].clone());

    // Backward, layer 1. Reads `h` and `w2` directly.
    let s = b.stage_start("layer_1_bwd", Some(1), &[&d]);
    let dp = b.op(Scale(2.0), &[&s[0]])?;
    let ht = b.op(Transpose, &[&h])?;
    let gw2 = b.op(MatMul, &[&ht, &dp])?;
    let w2t = b.op(Transpose, &[&w2])?;
    let dh = b.op(MatMul, &[&dp, &w2t])?;
    let e = b.stage_end("layer_1_bwd", &[&gw2, &dh]);
    let (gw2, dh) = (e[0].clone(), e[1].clone());

    // Backward, layer 0. Reads `x` directly.
    let s = b.stage_start("layer_0_bwd", Some(0), &[&dh, &z1]);
    let mask = b.op(Step, &[&s[1]])?;
    let dz = b.op(Mul, &[&s[0], &mask])?;
    let xt = b.op(Transpose, &[&x])?;
    let gw1 = b.op(MatMul, &[&xt, &dz])?;
    let e = b.stage_end("layer_0_bwd", &[&gw1]);
    let gw1 = e[0].clone();

    let grads = b.grad_barrier(&[&gw1, &gw2]);
    let step1 = b.op(Scale(lr), &[&grads[0]])?;
    let w1_new = b.op(Sub, &[&w1, &step1])?;
    let step2 = b.op(Scale(lr), &[&grads[1]])?;
    let w2_new = b.op(Sub, &[&w2, &step2])?;

    let (arena, graph) = b.finish(&[&loss, &w1_new, &w2_new]);
    Ok(TrainStep {
        arena,
        graph,
        donated_invars: vec![false, false, true, true],
        batch_invars: vec![true, true, false, false],
    })
}

/// Deterministic arguments `x, y, w1, w2` for a batch of `batch` rows.
pub fn mlp_inputs(batch: usize, seed: u64) -> Result<Vec<Tensor>> {
    let fill = |len: usize, salt: u64| -> Vec<f32> {
        (0..len as u64)
            .map(|i| {
                let v = (i * 37 + seed * 11 + salt * 7) % 17;
                v as f32 / 17.0 - 0.5
            })
            .collect()
    };
    Ok(vec![
        Tensor::new(vec![batch, MLP_IN], fill(batch * MLP_IN, 1))?,
        Tensor::new(vec![batch, MLP_OUT], fill(batch * MLP_OUT, 2))?,
        Tensor::new(vec![MLP_IN, MLP_HIDDEN], fill(MLP_IN * MLP_HIDDEN, 3))?,
        Tensor::new(vec![MLP_HIDDEN, MLP_OUT], fill(MLP_HIDDEN * MLP_OUT, 4))?,
    ])
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::eval_graph;

    #[test]
    fn reference_step_runs() {
        let step = mlp_training_step(4, 0.1).unwrap();
        let args = mlp_inputs(4, 0).unwrap();
        let out = eval_graph(&step.arena, &step.graph, &args).unwrap();

        assert_eq!(out.len(), 3);
        assert!(out[0].shape().is_empty());
        assert_eq!(out[1].shape(), &[MLP_IN, MLP_HIDDEN]);
        assert_eq!(out[2].shape(), &[MLP_HIDDEN, MLP_OUT]);
        assert_ne!(out[2], args[3]);
    }

    #[test]
    fn step_has_four_stages_and_a_barrier() {
        let step = mlp_training_step(2, 0.1).unwrap();
        let starts = step
            .graph
            .eqns
            .iter()
            .filter(|id| step.arena.get(**id).is_stage_start())
            .count();
        let barriers = step
            .graph
            .eqns
            .iter()
            .filter(|id| step.arena.get(**id).is_grad_barrier())
            .count();
        assert_eq!((starts, barriers), (4, 1));
    }
}
