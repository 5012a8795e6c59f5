//! Gradient accumulation across micro-batches.
//!
//! The compute graph runs once per micro-batch. Instead of producing a
//! fresh gradient each time, every gradient is added into an accumulator
//! that the next micro-batch reads back:
//!
//! ```text
//!   mb 0:  acc_out = add(zeros,  g)
//!   mb 1:  acc_out = add(acc_out@mb0, g)
//!   ...
//! ```
//!
//! The add is placed just before the end marker of the stage that produces
//! the gradient, so accumulation happens on the mesh that owns it.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::graph::{Eqn, EqnArena, EqnId, EqnKind, Graph, Primitive, Var};

/// Result of [`accumulate_gradients`].
#[derive(Debug, Clone)]
pub struct AccumulatedGraph {
    /// Compute graph with accumulator inputs appended to its invars and
    /// each gradient output replaced by its accumulator output.
    pub graph: Graph,
    /// Original gradient → accumulator output.
    pub grad_to_acc: HashMap<Var, Var>,
    /// (accumulator input, accumulator output), one pair per gradient.
    pub acc_pairs: Vec<(Var, Var)>,
}

/// Rewrite `compute` so that every gradient fed to `barrier` accumulates.
pub fn accumulate_gradients(
    arena: &mut EqnArena,
    compute: &Graph,
    barrier: &Eqn,
) -> Result<AccumulatedGraph> {
    // Where every stage closes, and which stage each equation sits in.
    let mut enclosing: Vec<Option<usize>> = Vec::with_capacity(compute.eqns.len());
    let mut stage_ends: Vec<usize> = Vec::new();
    let mut open: Option<usize> = None;
    for (pos, id) in compute.eqns.iter().enumerate() {
        let eqn = arena.get(*id);
        match &eqn.kind {
            EqnKind::StageStart { .. } => {
                open = Some(stage_ends.len());
                enclosing.push(open);
            }
            EqnKind::StageEnd { .. } => {
                enclosing.push(open);
                if open.is_some() {
                    stage_ends.push(pos);
                }
                open = None;
            }
            _ => enclosing.push(open),
        }
    }

    let mut producer: HashMap<Var, usize> = HashMap::new();
    for (pos, id) in compute.eqns.iter().enumerate() {
        for v in &arena.get(*id).outvars {
            if !v.is_dropped() {
                producer.insert(v.clone(), pos);
            }
        }
    }

    // New equations to splice in, keyed by the end-marker position.
    let mut inserts: HashMap<usize, Vec<Eqn>> = HashMap::new();
    let mut grad_to_acc = HashMap::new();
    let mut acc_pairs = Vec::new();

    for (g, out) in barrier.invars.iter().zip(&barrier.outvars) {
        if out.is_dropped() || grad_to_acc.contains_key(g) {
            continue;
        }
        let pos = producer.get(g).copied().ok_or_else(|| {
            PipelineError::Transform(format!("gradient {g} is not produced by the compute graph"))
        })?;
        let stage = enclosing[pos].ok_or_else(|| {
            PipelineError::Transform(format!("gradient {g} is produced outside of any stage"))
        })?;
        let end_pos = stage_ends.get(stage).copied().ok_or_else(|| {
            PipelineError::Transform(format!("stage producing gradient {g} is never closed"))
        })?;

        // Read the stage-internal alias of an exported gradient.
        let producing = arena.get(compute.eqns[pos]);
        let g_inner = if producing.is_stage_end() {
            producing
                .outvars
                .iter()
                .position(|v| v == g)
                .map(|i| producing.invars[i].clone())
                .unwrap_or_else(|| g.clone())
        } else {
            g.clone()
        };

        let acc_in = arena.fresh_like(g);
        let acc_out = arena.fresh_like(g);
        inserts.entry(end_pos).or_default().push(Eqn::op(
            Primitive::Add,
            vec![acc_in.clone(), g_inner],
            acc_out.clone(),
        ));
        grad_to_acc.insert(g.clone(), acc_out.clone());
        acc_pairs.push((acc_in, acc_out));
    }

    let mut eqns: Vec<EqnId> = Vec::with_capacity(compute.eqns.len() + acc_pairs.len());
    for (pos, id) in compute.eqns.iter().enumerate() {
        if let Some(new) = inserts.remove(&pos) {
            for eqn in new {
                eqns.push(arena.push(eqn));
            }
        }
        eqns.push(*id);
    }

    let mut invars = compute.invars.clone();
    invars.extend(acc_pairs.iter().map(|(acc_in, _)| acc_in.clone()));
    let outvars = compute
        .outvars
        .iter()
        .map(|v| grad_to_acc.get(v).cloned().unwrap_or_else(|| v.clone()))
        .collect();

    debug!(num_gradients = acc_pairs.len(), "inserted gradient accumulators");
    Ok(AccumulatedGraph {
        graph: Graph::new(invars, outvars, eqns),
        grad_to_acc,
        acc_pairs,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
