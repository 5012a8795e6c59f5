//! Splitting a training step at its gradient barrier, and slicing the
//! gradient-application part into one stage per mesh.
//!
//! ```text
//!   [ compute stages ... ] ──▶ grad_barrier ──▶ [ apply equations ... ]
//!            │                                          │
//!     accumulate per mb                       mean by mb count, then
//!                                             one apply_grad_{m} per mesh
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::graph::{free_vars, push_unique, Eqn, EqnArena, EqnId, EqnKind, Graph, Primitive, Var};
use crate::stage::Stage;

// ── Split ─────────────────────────────────────────────────────────────────────

/// The three parts of a training step.
#[derive(Debug, Clone)]
pub struct SplitGraph {
    pub compute: Graph,
    pub apply: Graph,
    pub barrier: Option<EqnId>,
}

/// Cut `graph` at its gradient barrier. The last barrier wins.
///
/// Without a barrier the whole graph is compute, the apply graph is empty
/// and `barrier` is `None`. That means no gradient accumulation is set up;
/// it is not an error.
pub fn split_compute_and_apply(arena: &EqnArena, graph: &Graph) -> SplitGraph {
    let split = graph
        .eqns
        .iter()
        .rposition(|id| arena.get(*id).is_grad_barrier());

    let Some(split) = split else {
        warn!("no gradient barrier between compute and apply; gradients will not accumulate");
        return SplitGraph {
            compute: graph.clone(),
            apply: Graph::default(),
            barrier: None,
        };
    };

    let barrier_id = graph.eqns[split];
    let barrier = arena.get(barrier_id);
    let compute_eqns = graph.eqns[..split].to_vec();
    let apply_eqns = graph.eqns[split + 1..].to_vec();

    let compute_defined: HashSet<Var> = compute_eqns
        .iter()
        .flat_map(|id| arena.get(*id).outvars.iter())
        .filter(|v| !v.is_dropped())
        .cloned()
        .collect();
    let apply_defined: HashSet<Var> = apply_eqns
        .iter()
        .flat_map(|id| arena.get(*id).outvars.iter())
        .filter(|v| !v.is_dropped())
        .cloned()
        .collect();
    let apply_free = free_vars(apply_eqns.iter().map(|id| arena.get(*id)));

    let compute_read: HashSet<Var> = compute_eqns
        .iter()
        .flat_map(|id| arena.get(*id).invars.iter())
        .cloned()
        .collect();
    let compute_invars = graph
        .invars
        .iter()
        .filter(|v| compute_read.contains(*v))
        .cloned()
        .collect();

    let mut compute_outvars = Vec::new();
    for v in barrier.invars.iter().chain(&apply_free).chain(&graph.outvars) {
        if compute_defined.contains(v) {
            push_unique(&mut compute_outvars, v);
        }
    }

    let apply_outvars = graph
        .outvars
        .iter()
        .filter(|v| apply_defined.contains(*v))
        .cloned()
        .collect();

    debug!(
        compute_eqns = compute_eqns.len(),
        apply_eqns = apply_eqns.len(),
        "split training step at gradient barrier"
    );

    SplitGraph {
        compute: Graph::new(compute_invars, compute_outvars, compute_eqns),
        apply: Graph::new(apply_free, apply_outvars, apply_eqns),
        barrier: Some(barrier_id),
    }
}

// ── Gradient ownership ────────────────────────────────────────────────────────

/// Gradients leaving the barrier, and the accumulator each one stands for.
#[derive(Debug, Clone, Default)]
pub struct GradMask {
    pub gradients: Vec<Var>,
    pub mask: HashMap<Var, Var>,
}

/// Pair every live barrier output with the accumulator of its input.
pub fn grad_mask(barrier: &Eqn, grad_to_acc: &HashMap<Var, Var>) -> Result<GradMask> {
    let mut out = GradMask::default();
    for (g, grad) in barrier.invars.iter().zip(&barrier.outvars) {
        if grad.is_dropped() {
            continue;
        }
        let acc = grad_to_acc.get(g).ok_or_else(|| {
            PipelineError::Transform(format!("gradient {g} has no accumulator"))
        })?;
        out.gradients.push(grad.clone());
        out.mask.insert(grad.clone(), acc.clone());
    }
    Ok(out)
}

/// Each gradient belongs to the mesh of the stage that exports its
/// accumulator.
pub fn mark_grad_mesh(
    mask: &GradMask,
    stages: &[Stage],
    stage_to_mesh: &[usize],
) -> Result<HashMap<Var, usize>> {
    let mut exporter: HashMap<&Var, usize> = HashMap::new();
    for (i, stage) in stages.iter().enumerate() {
        for v in &stage.outvars {
            exporter.insert(v, i);
        }
    }

    let mut grad_mesh = HashMap::with_capacity(mask.gradients.len());
    for grad in &mask.gradients {
        let acc = &mask.mask[grad];
        let stage = exporter.get(acc).copied().ok_or_else(|| {
            PipelineError::Transform(format!("accumulator {acc} of {grad} is not exported by any stage"))
        })?;
        let mesh = stage_to_mesh.get(stage).copied().ok_or_else(|| {
            PipelineError::Mesh(format!("stage {stage} has no mesh assignment"))
        })?;
        grad_mesh.insert(grad.clone(), mesh);
    }
    Ok(grad_mesh)
}

// ── Mean ──────────────────────────────────────────────────────────────────────

/// Divide every gradient by the micro-batch count before it is applied.
///
/// Returns the new apply graph and the global outputs, both rewritten to
/// read the mean instead of the raw sum.
pub fn apply_mean(
    arena: &mut EqnArena,
    apply: &Graph,
    gradients: &[Var],
    num_micro_batches: usize,
    global_outvars: &[Var],
) -> (Graph, Vec<Var>) {
    let factor = 1.0 / num_micro_batches.max(1) as f32;
    let mut rename = HashMap::with_capacity(gradients.len());
    let mut eqns = Vec::with_capacity(apply.eqns.len() + gradients.len());

    for g in gradients {
        let mean = arena.fresh_like(g);
        eqns.push(arena.push(Eqn::op(Primitive::Scale(factor), vec![g.clone()], mean.clone())));
        rename.insert(g.clone(), mean);
    }
    for &id in &apply.eqns {
        let eqn = arena.get(id).substituted(&rename, false);
        eqns.push(arena.replace(id, eqn));
    }

    let sub = |v: &Var| rename.get(v).cloned().unwrap_or_else(|| v.clone());
    let global_outvars: Vec<Var> = global_outvars.iter().map(sub).collect();

    let defined: HashSet<Var> = eqns
        .iter()
        .flat_map(|id| arena.get(*id).outvars.iter())
        .filter(|v| !v.is_dropped())
        .cloned()
        .collect();
    let mut outvars = Vec::new();
    for v in global_outvars.iter().filter(|v| defined.contains(*v)) {
        push_unique(&mut outvars, v);
    }

    let mut invars = apply.invars.clone();
    for g in gradients {
        push_unique(&mut invars, g);
    }

    (Graph::new(invars, outvars, eqns), global_outvars)
}

// ── Slicing ───────────────────────────────────────────────────────────────────

/// Apply-gradient stages, one per mesh that has work.
#[derive(Debug, Clone, Default)]
pub struct ApplyStages {
    pub stages: Vec<Stage>,
    /// Mesh of each entry in `stages`.
    pub placement: Vec<usize>,
    /// Global output → the fresh name it is exported under.
    pub out_map: HashMap<Var, Var>,
}

/// Slice the apply graph by gradient ownership.
///
/// Mesh sets flow forward from the gradients to everything computed from
/// them, then backward to every producer, so each slice carries its whole
/// upstream cone and never reads another apply slice. Equations touching no
/// gradient run on mesh 0. A value a slice reads from outside is taken from
/// the accumulator in `mask` when it is a gradient.
pub fn slice_apply_gradient(
    arena: &mut EqnArena,
    apply: &Graph,
    grad_mesh: &HashMap<Var, usize>,
    mask: &HashMap<Var, Var>,
    num_meshes: usize,
) -> Result<ApplyStages> {
    if let Some((g, m)) = grad_mesh.iter().find(|(_, m)| **m >= num_meshes) {
        return Err(PipelineError::Mesh(format!(
            "gradient {g} is owned by mesh {m}, but there are only {num_meshes} meshes"
        )));
    }

    // Forward.
    let mut var_mesh: HashMap<Var, BTreeSet<usize>> = grad_mesh
        .iter()
        .map(|(v, m)| (v.clone(), BTreeSet::from([*m])))
        .collect();
    let mut eqn_mesh: Vec<BTreeSet<usize>> = Vec::with_capacity(apply.eqns.len());
    for &id in &apply.eqns {
        let eqn = arena.get(id);
        let mut set = BTreeSet::new();
        for v in &eqn.invars {
            if let Some(s) = var_mesh.get(v) {
                set.extend(s.iter().copied());
            }
        }
        if !set.is_empty() {
            for v in eqn.outvars.iter().filter(|v| !v.is_dropped()) {
                var_mesh.entry(v.clone()).or_default().extend(set.iter().copied());
            }
        }
        eqn_mesh.push(set);
    }
    for set in eqn_mesh.iter_mut().filter(|s| s.is_empty()) {
        set.insert(0);
    }

    // Backward.
    let mut producer: HashMap<Var, usize> = HashMap::new();
    for (i, &id) in apply.eqns.iter().enumerate() {
        for v in arena.get(id).outvars.iter().filter(|v| !v.is_dropped()) {
            producer.insert(v.clone(), i);
        }
    }
    for i in (0..apply.eqns.len()).rev() {
        let consumers = eqn_mesh[i].clone();
        for v in &arena.get(apply.eqns[i]).invars {
            if let Some(&p) = producer.get(v) {
                if p < i {
                    eqn_mesh[p].extend(consumers.iter().copied());
                }
            }
        }
    }

    let mut out = ApplyStages::default();
    for mesh in 0..num_meshes {
        let picked: Vec<EqnId> = apply
            .eqns
            .iter()
            .zip(&eqn_mesh)
            .filter(|(_, set)| set.contains(&mesh))
            .map(|(id, _)| *id)
            .collect();
        if picked.is_empty() {
            continue;
        }

        let name = format!("apply_grad_{mesh}");
        let mut rename = HashMap::new();
        let mut inner_of: HashMap<Var, Var> = HashMap::new();
        let (mut start_in, mut start_out) = (Vec::new(), Vec::new());
        for v in free_vars(picked.iter().map(|id| arena.get(*id))) {
            // Gradients sharing one accumulator enter the stage once.
            let outer = mask.get(&v).cloned().unwrap_or_else(|| v.clone());
            let inner = match inner_of.get(&outer) {
                Some(inner) => inner.clone(),
                None => {
                    let inner = arena.fresh_like(&v);
                    start_in.push(outer.clone());
                    start_out.push(inner.clone());
                    inner_of.insert(outer, inner.clone());
                    inner
                }
            };
            rename.insert(v, inner);
        }

        let mut eqns = Vec::with_capacity(picked.len() + 2);
        eqns.push(arena.push(Eqn {
            kind: EqnKind::StageStart {
                name: name.clone(),
                mesh: Some(mesh),
            },
            invars: start_in,
            outvars: start_out,
        }));
        let mut defined = HashSet::new();
        for &id in &picked {
            let eqn = arena.get(id).substituted(&rename, false);
            defined.extend(eqn.outvars.iter().filter(|v| !v.is_dropped()).cloned());
            eqns.push(arena.replace(id, eqn));
        }

        let (mut end_in, mut end_out) = (Vec::new(), Vec::new());
        for v in &apply.outvars {
            if !defined.contains(v) || end_in.contains(v) {
                continue;
            }
            let outer = arena.fresh_like(v);
            end_in.push(v.clone());
            end_out.push(outer.clone());
            out.out_map.entry(v.clone()).or_insert(outer);
        }
        eqns.push(arena.push(Eqn {
            kind: EqnKind::StageEnd { name },
            invars: end_in,
            outvars: end_out,
        }));

        let stage = Stage::from_eqns(arena, eqns)?.with_mesh(mesh);
        debug!(
            stage = %stage.name,
            eqns = picked.len(),
            inputs = stage.invars.len(),
            outputs = stage.outvars.len(),
            "sliced apply-gradient stage"
        );
        out.stages.push(stage);
        out.placement.push(mesh);
    }
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::interpreter::eval_graph;
    use stagemesh_types::Tensor;

    struct Step {
        arena: EqnArena,
        graph: Graph,
        w0: Var,
        w1: Var,
        w0_new: Var,
        w1_new: Var,
    }

    /// Two parameters whose gradients come from two stages, then SGD.
    fn step() -> Step {
        let mut b = GraphBuilder::new();
        let w0 = b.input("w0", &[2]).unwrap();
        let w1 = b.input("w1", &[2]).unwrap();

        let s0 = b.stage_start("a", None, &[&w0]);
        let g0 = b.op(Primitive::Scale(2.0), &[&s0[0]]).unwrap();
        let e0 = b.stage_end("a", &[&g0]);
        let s1 = b.stage_start("b", None, &[&w1]);
        let g1 = b.op(Primitive::Scale(3.0), &[&s1[0]]).unwrap();
        let e1 = b.stage_end("b", &[&g1]);

        let grads = b.grad_barrier(&[&e0[0], &e1[0]]);
        let d0 = b.op(Primitive::Scale(0.5), &[&grads[0]]).unwrap();
        let w0_new = b.op(Primitive::Sub, &[&w0, &d0]).unwrap();
        let d1 = b.op(Primitive::Scale(0.5), &[&grads[1]]).unwrap();
        let w1_new = b.op(Primitive::Sub, &[&w1, &d1]).unwrap();
        let (arena, graph) = b.finish(&[&w0_new, &w1_new]);
        Step {
            arena,
            graph,
            w0,
            w1,
            w0_new,
            w1_new,
        }
    }

    #[test]
    fn split_without_barrier_is_soft() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", &[1]).unwrap();
        let s = b.stage_start("s", None, &[&x]);
        let e = b.stage_end("s", &[&s[0]]);
        let (arena, graph) = b.finish(&[&e[0]]);

        let split = split_compute_and_apply(&arena, &graph);
        assert!(split.barrier.is_none());
        assert!(split.apply.is_empty());
        assert_eq!(split.compute, graph);
    }

    #[test]
    fn split_at_barrier() {
        let s = step();
        let split = split_compute_and_apply(&s.arena, &s.graph);
        let barrier = split.barrier.unwrap();
        assert!(s.arena.get(barrier).is_grad_barrier());

        assert_eq!(split.compute.invars, vec![s.w0.clone(), s.w1.clone()]);
        assert_eq!(split.compute.outvars, s.arena.get(barrier).invars);
        assert_eq!(split.apply.eqns.len(), 4);
        assert_eq!(split.apply.outvars, vec![s.w0_new.clone(), s.w1_new.clone()]);
        // Apply reads both gradients and both parameters.
        assert_eq!(split.apply.invars.len(), 4);
    }

    #[test]
    fn mean_scales_gradients() {
        let mut s = step();
        let split = split_compute_and_apply(&s.arena, &s.graph);
        let barrier = s.arena.get(split.barrier.unwrap()).clone();
        let gradients = barrier.outvars.clone();

        let (apply, outvars) =
            apply_mean(&mut s.arena, &split.apply, &gradients, 4, &s.graph.outvars);
        assert_eq!(outvars, s.graph.outvars);
        assert_eq!(apply.eqns.len(), 6);

        let args: Vec<Tensor> = apply
            .invars
            .iter()
            .map(|v| {
                if gradients.contains(v) {
                    Tensor::new(vec![2], vec![8.0, 8.0]).unwrap()
                } else {
                    Tensor::new(vec![2], vec![1.0, 1.0]).unwrap()
                }
            })
            .collect();
        let out = eval_graph(&s.arena, &apply, &args).unwrap();
        // w - 0.5 * (8 / 4)
        assert_eq!(out[0].data(), &[0.0, 0.0]);
    }

    #[test]
    fn slices_follow_gradient_ownership() {
        let mut s = step();
        let split = split_compute_and_apply(&s.arena, &s.graph);
        let barrier = s.arena.get(split.barrier.unwrap()).clone();
        let grads = barrier.outvars.clone();

        let grad_mesh: HashMap<Var, usize> =
            [(grads[0].clone(), 0), (grads[1].clone(), 1)].into_iter().collect();
        let acc0 = Var::new("acc0", vec![2]);
        let acc1 = Var::new("acc1", vec![2]);
        let mask: HashMap<Var, Var> = [(grads[0].clone(), acc0.clone()), (grads[1].clone(), acc1.clone())]
            .into_iter()
            .collect();

        let sliced =
            slice_apply_gradient(&mut s.arena, &split.apply, &grad_mesh, &mask, 2).unwrap();
        assert_eq!(sliced.placement, vec![0, 1]);
        assert_eq!(sliced.stages[0].name, "apply_grad_0");
        assert_eq!(sliced.stages[0].mesh, Some(0));

        // Stage 0 reads w0 and the accumulator, never the raw gradient.
        assert!(sliced.stages[0].invars.contains(&acc0));
        assert!(sliced.stages[0].invars.contains(&s.w0));
        assert!(!sliced.stages[0].invars.contains(&grads[0]));
        assert!(sliced.stages[1].invars.contains(&acc1));

        assert_eq!(sliced.out_map.len(), 2);
        assert_eq!(sliced.stages[0].outvars, vec![sliced.out_map[&s.w0_new].clone()]);
        assert_eq!(sliced.stages[1].outvars, vec![sliced.out_map[&s.w1_new].clone()]);
    }

    #[test]
    fn shared_consumer_is_replicated() {
        let mut b = GraphBuilder::new();
        let g0 = b.input("g0", &[1]).unwrap();
        let g1 = b.input("g1", &[1]).unwrap();
        let n0 = b.op(Primitive::Mul, &[&g0, &g0]).unwrap();
        let n1 = b.op(Primitive::Mul, &[&g1, &g1]).unwrap();
        let norm = b.op(Primitive::Add, &[&n0, &n1]).unwrap();
        let (mut arena, graph) = b.finish(&[&norm]);
        let apply = Graph::new(vec![g0.clone(), g1.clone()], graph.outvars.clone(), graph.eqns);

        let grad_mesh: HashMap<Var, usize> = [(g0, 0), (g1, 1)].into_iter().collect();
        let sliced =
            slice_apply_gradient(&mut arena, &apply, &grad_mesh, &HashMap::new(), 2).unwrap();

        // Both meshes need the norm, so both carry all three equations.
        for stage in &sliced.stages {
            assert_eq!(stage.body().len(), 3);
            assert_eq!(stage.invars.len(), 2);
        }
        // The lowest mesh provides the global output.
        assert_eq!(sliced.out_map[&norm], sliced.stages[0].outvars[0]);
    }

    #[test]
    fn gradients_sharing_an_accumulator_enter_once() {
        let mut b = GraphBuilder::new();
        let g0 = b.input("g0", &[1]).unwrap();
        let g1 = b.input("g1", &[1]).unwrap();
        let sum = b.op(Primitive::Add, &[&g0, &g1]).unwrap();
        let (mut arena, graph) = b.finish(&[&sum]);
        let apply = Graph::new(vec![g0.clone(), g1.clone()], graph.outvars.clone(), graph.eqns);

        let acc = Var::new("acc", vec![1]);
        let grad_mesh: HashMap<Var, usize> = [(g0.clone(), 0), (g1.clone(), 0)].into_iter().collect();
        let mask: HashMap<Var, Var> =
            [(g0, acc.clone()), (g1, acc.clone())].into_iter().collect();
        let sliced = slice_apply_gradient(&mut arena, &apply, &grad_mesh, &mask, 1).unwrap();

        let stage = &sliced.stages[0];
        assert_eq!(stage.invars, vec![acc]);
        let stage_graph = Graph::new(stage.invars.clone(), stage.outvars.clone(), stage.eqns.clone());
        let out = eval_graph(&arena, &stage_graph, &[Tensor::new(vec![1], vec![3.0]).unwrap()])
            .unwrap();
        assert_eq!(out[0].data(), &[6.0]);
    }

    #[test]
    fn out_of_range_mesh_is_rejected() {
        let s = step();
        let split = split_compute_and_apply(&s.arena, &s.graph);
        let mut arena = s.arena.clone();
        let grad_mesh: HashMap<Var, usize> =
            [(split.apply.invars[0].clone(), 5)].into_iter().collect();
        assert!(
            slice_apply_gradient(&mut arena, &split.apply, &grad_mesh, &HashMap::new(), 2)
                .is_err()
        );
    }
}
