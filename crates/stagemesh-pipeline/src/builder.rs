//! End-to-end compilation of a traced training step into a [`Pipeline`].
//!
//! Algorithm:
//! 1. Split at the gradient barrier; accumulate gradients across micro-batches.
//! 2. Slice by stage markers, backfill boundary vars, drop dead code.
//! 3. Mirror the stages onto `n / 2` meshes.
//! 4. Average gradients and slice gradient application per mesh.
//! 5. Build the dependency graph and the GPipe schedule.
//! 6. Launch meshes, split donation flags, compile every stage.

use std::sync::Arc;

use stagemesh_types::{PipelineConfig, VirtualMesh};
use tracing::{info, warn};
use uuid::Uuid;

use crate::accumulate::accumulate_gradients;
use crate::apply::{apply_mean, grad_mask, mark_grad_mesh, slice_apply_gradient, split_compute_and_apply};
use crate::compiler::{CompileRequest, StageCompiler};
use crate::dependency::DependencyGraph;
use crate::donation::split_donate_invars;
use crate::error::{PipelineError, Result};
use crate::graph::{EqnArena, Graph};
use crate::mesh::{MeshFactory, MeshProvisioner};
use crate::runtime::Pipeline;
use crate::scheduler::GpipeSchedule;
use crate::stage::{backfill_missing_vars, eliminate_dead_code, mirrored_stage_to_mesh, slice_by_markers};

/// A traced training step plus the per-input flags the caller supplies.
#[derive(Debug, Clone)]
pub struct TrainStep {
    pub arena: EqnArena,
    pub graph: Graph,
    /// Per global input: the caller allows its buffer to be reused.
    pub donated_invars: Vec<bool>,
    /// Per global input: axis 0 is the batch and is split into micro-batches.
    pub batch_invars: Vec<bool>,
}

/// Compile `step` into a runnable pipeline over `virtual_mesh`.
pub fn compile_pipeline(
    step: TrainStep,
    virtual_mesh: &VirtualMesh,
    config: &PipelineConfig,
    compiler: &dyn StageCompiler,
    provisioner: Arc<dyn MeshProvisioner>,
) -> Result<Pipeline> {
    config.validate()?;
    let TrainStep {
        mut arena,
        graph,
        donated_invars,
        batch_invars,
    } = step;
    let n_inputs = graph.invars.len();
    if donated_invars.len() != n_inputs || batch_invars.len() != n_inputs {
        return Err(PipelineError::Transform(format!(
            "{n_inputs} global inputs but {} donation and {} batch flags",
            donated_invars.len(),
            batch_invars.len()
        )));
    }

    let num_micro_batches = match config.num_micro_batches {
        Some(n) => n as usize,
        None => {
            warn!("number of micro-batches is unset, using 1");
            1
        }
    };

    // ── 1. Split and accumulate ──────────────────────────────────────────
    let split = split_compute_and_apply(&arena, &graph);
    let barrier = split.barrier.map(|id| arena.get(id).clone());
    let (acc_graph, grad_to_acc, acc_pairs) = match &barrier {
        Some(barrier) => {
            let acc = accumulate_gradients(&mut arena, &split.compute, barrier)?;
            (acc.graph, acc.grad_to_acc, acc.acc_pairs)
        }
        None => (split.compute.clone(), Default::default(), Vec::new()),
    };

    // ── 2. Slice ─────────────────────────────────────────────────────────
    let stages = slice_by_markers(&arena, &acc_graph)?;
    let stages = backfill_missing_vars(&mut arena, stages, &acc_graph.invars, &acc_graph.outvars)?;
    let stages = eliminate_dead_code(&mut arena, stages, &acc_graph.outvars)?;

    // ── 3. Mirror onto meshes ────────────────────────────────────────────
    let num_pipeline = stages.len();
    if num_pipeline == 0 || num_pipeline % 2 != 0 {
        return Err(PipelineError::Scheduling(format!(
            "forward/backward pipeline needs a positive even stage count, got {num_pipeline}"
        )));
    }
    let num_meshes = num_pipeline / 2;
    let stage_to_mesh = mirrored_stage_to_mesh(num_pipeline);
    let mut stages = stages
        .into_iter()
        .zip(&stage_to_mesh)
        .map(|(stage, &mesh)| match stage.mesh {
            Some(pinned) if pinned != mesh => Err(PipelineError::Mesh(format!(
                "stage {} is pinned to mesh {pinned} but mirrored onto mesh {mesh}",
                stage.name
            ))),
            _ => Ok(stage.with_mesh(mesh)),
        })
        .collect::<Result<Vec<_>>>()?;

    // ── 4. Gradient application ──────────────────────────────────────────
    let mut global_outvars = graph.outvars.clone();
    let mut apply_placement: Vec<(usize, usize)> = Vec::new();
    let dependency = match &barrier {
        Some(barrier) => {
            let mask = grad_mask(barrier, &grad_to_acc)?;
            let grad_mesh = mark_grad_mesh(&mask, &stages, &stage_to_mesh)?;
            let (apply, outvars) = apply_mean(
                &mut arena,
                &split.apply,
                &mask.gradients,
                num_micro_batches,
                &global_outvars,
            );
            let sliced =
                slice_apply_gradient(&mut arena, &apply, &grad_mesh, &mask.mask, num_meshes)?;
            global_outvars = outvars
                .iter()
                .map(|v| sliced.out_map.get(v).cloned().unwrap_or_else(|| v.clone()))
                .collect();
            apply_placement = sliced
                .placement
                .iter()
                .enumerate()
                .map(|(i, mesh)| (num_pipeline + i, *mesh))
                .collect();
            stages.extend(sliced.stages);
            DependencyGraph::linear_with_apply(stages.len(), num_meshes, &apply_placement)?
        }
        None => DependencyGraph::linear(num_pipeline),
    };

    // ── 5. Schedule ──────────────────────────────────────────────────────
    let schedule = GpipeSchedule::new(&dependency, num_meshes, &apply_placement, num_micro_batches)?;

    // ── 6. Meshes, donation, compilation ─────────────────────────────────
    let sub_meshes = virtual_mesh.split(num_meshes)?;
    let factory = MeshFactory::new(provisioner);
    let meshes = sub_meshes
        .iter()
        .enumerate()
        .map(|(i, vm)| factory.get_or_launch(i, vm))
        .collect::<Result<Vec<_>>>()?;

    // Accumulators are always donatable; caller-visible outputs never are.
    let mut all_invars = graph.invars.clone();
    let mut all_donation = donated_invars;
    all_invars.extend(acc_pairs.iter().map(|(acc_in, _)| acc_in.clone()));
    all_donation.extend(std::iter::repeat(true).take(acc_pairs.len()));
    all_invars.extend(global_outvars.iter().cloned());
    all_donation.extend(std::iter::repeat(false).take(global_outvars.len()));

    let pattern: Vec<Vec<usize>> = (0..num_meshes).map(|m| schedule.mesh_stages(m)).collect();
    let flags = split_donate_invars(&all_donation, &all_invars, &stages, &pattern)?;
    for (stage, flags) in stages.iter_mut().zip(flags) {
        stage.set_donation(flags)?;
    }

    let mut executables = Vec::with_capacity(stages.len());
    let mut memory_per_device = Vec::with_capacity(stages.len());
    for (i, stage) in stages.iter().enumerate() {
        let mesh_index = schedule.stage_placement(i).ok_or_else(|| {
            PipelineError::Scheduling(format!("stage {} has no mesh", stage.name))
        })?;
        let mesh = &meshes[mesh_index];
        let compiled = compiler.compile(CompileRequest {
            arena: &arena,
            stage,
            mesh_index,
            mesh: mesh.as_ref(),
            logical_mesh: mesh.default_logical_mesh(),
            donation: stage.donation().unwrap_or(&[]),
            memory_budget_per_device: config.memory_budget_per_device,
        })?;
        if let Some(budget) = config.memory_budget_per_device {
            if compiled.memory_per_device > budget {
                return Err(PipelineError::Compile(format!(
                    "stage {} needs {} bytes per device, budget is {budget}",
                    stage.name, compiled.memory_per_device
                )));
            }
        }
        info!(
            stage = %stage.name,
            mesh = mesh_index,
            memory_per_device = compiled.memory_per_device,
            "compiled stage"
        );
        executables.push(compiled.executable);
        memory_per_device.push(compiled.memory_per_device);
    }

    let pipeline_id = Uuid::new_v4();
    info!(
        pipeline = %pipeline_id,
        stages = stages.len(),
        meshes = num_meshes,
        micro_batches = num_micro_batches,
        ticks = schedule.num_ticks(),
        "compiled pipeline"
    );

    Ok(Pipeline {
        pipeline_id,
        created_at: chrono::Utc::now(),
        stages,
        executables,
        memory_per_device,
        schedule,
        dependency,
        meshes,
        global_invars: graph.invars,
        global_outvars,
        batch_invars,
        acc_pairs,
        concurrent_dispatch: config.concurrent_dispatch,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Primitive};
    use crate::interpreter::{eval_graph, InterpreterCompiler};
    use crate::mesh::LocalProvisioner;
    use crate::transport::{decode_plan, encode_plan};
    use crate::workloads::{mlp_inputs, mlp_training_step};
    use stagemesh_types::Tensor;

    const BATCH: usize = 8;
    const LR: f32 = 0.05;

    fn config(micro_batches: Option<u32>, concurrent: bool) -> PipelineConfig {
        PipelineConfig {
            num_micro_batches: micro_batches,
            memory_budget_per_device: None,
            concurrent_dispatch: concurrent,
        }
    }

    fn compile_mlp(config: &PipelineConfig) -> Result<Pipeline> {
        let rows = BATCH / config.num_micro_batches.unwrap_or(1) as usize;
        compile_pipeline(
            mlp_training_step(rows, LR)?,
            &VirtualMesh::new(2, 1),
            config,
            &InterpreterCompiler,
            Arc::new(LocalProvisioner),
        )
    }

    /// Two stages, no gradient barrier.
    fn forward_backward(fwd_mesh: Option<usize>) -> TrainStep {
        let mut b = GraphBuilder::new();
        let x = b.input("x", &[2, 2]).unwrap();
        let w = b.input("w", &[2, 2]).unwrap();
        let s = b.stage_start("fwd", fwd_mesh, &[&x, &w]);
        let y = b.op(Primitive::MatMul, &[&s[0], &s[1]]).unwrap();
        let e = b.stage_end("fwd", &[&y]);
        let s = b.stage_start("bwd", None, &[&e[0]]);
        let z = b.op(Primitive::Relu, &[&s[0]]).unwrap();
        let e = b.stage_end("bwd", &[&z]);
        let (arena, graph) = b.finish(&[&e[0]]);
        TrainStep {
            arena,
            graph,
            donated_invars: vec![false, false],
            batch_invars: vec![true, false],
        }
    }

    #[tokio::test]
    async fn pipelined_step_matches_reference() {
        let args = mlp_inputs(BATCH, 3).unwrap();
        let pipeline = compile_mlp(&config(Some(4), true)).unwrap();
        let out = pipeline.run(args.clone()).await.unwrap();
        assert_eq!(out.len(), 3);

        // Summed gradients averaged over 4 micro-batches equal the full-batch
        // gradient scaled by 1/4.
        let reference = mlp_training_step(BATCH, LR / 4.0).unwrap();
        let expected = eval_graph(&reference.arena, &reference.graph, &args).unwrap();
        for i in 1..3 {
            let diff = out[i].max_abs_diff(&expected[i]).unwrap();
            assert!(diff < 1e-4, "output {i} differs by {diff}");
        }

        // The loss comes from the last micro-batch.
        let xs = args[0].split_batch(4).unwrap();
        let ys = args[1].split_batch(4).unwrap();
        let last = mlp_training_step(BATCH / 4, LR).unwrap();
        let last_args = vec![xs[3].clone(), ys[3].clone(), args[2].clone(), args[3].clone()];
        let expected = eval_graph(&last.arena, &last.graph, &last_args).unwrap();
        assert!(out[0].max_abs_diff(&expected[0]).unwrap() < 1e-4);
    }

    #[tokio::test]
    async fn serial_and_concurrent_dispatch_agree() {
        let args = mlp_inputs(BATCH, 7).unwrap();
        let serial = compile_mlp(&config(Some(2), false)).unwrap();
        let concurrent = compile_mlp(&config(Some(2), true)).unwrap();
        let a = serial.run(args.clone()).await.unwrap();
        let b = concurrent.run(args).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn pipeline_runs_repeatedly() {
        let args = mlp_inputs(BATCH, 1).unwrap();
        let pipeline = compile_mlp(&config(Some(2), true)).unwrap();
        let first = pipeline.run(args.clone()).await.unwrap();
        let second = pipeline.run(args).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn mlp_pipeline_layout() {
        let pipeline = compile_mlp(&config(Some(4), true)).unwrap();
        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["layer_0", "layer_1", "layer_1_bwd", "layer_0_bwd", "apply_grad_0", "apply_grad_1"]
        );
        let placement: Vec<usize> = (0..6)
            .map(|i| pipeline.schedule().stage_placement(i).unwrap())
            .collect();
        assert_eq!(placement, vec![0, 1, 1, 0, 0, 1]);
        assert_eq!(pipeline.schedule().num_ticks(), 2 * (4 + 2 - 1) + 1);
        assert_eq!(pipeline.meshes().len(), 2);
        assert!(pipeline.dependency().depends_on(4, 3));
        assert!(pipeline.dependency().depends_on(5, 2));
    }

    #[test]
    fn caller_kept_inputs_are_never_donated() {
        let pipeline = compile_mlp(&config(Some(2), true)).unwrap();
        let kept = &pipeline.global_invars()[..2];
        for (stage, flags) in pipeline.stages().iter().zip(pipeline.donation_table()) {
            assert_eq!(flags.len(), stage.invars.len());
            for (var, flag) in stage.invars.iter().zip(flags) {
                assert!(!(*flag && kept.contains(var)), "{} donates {var}", stage.name);
            }
        }
    }

    #[test]
    fn plan_snapshot_round_trips() {
        let pipeline = compile_mlp(&config(Some(2), true)).unwrap();
        let plan = pipeline.plan();
        assert_eq!(plan.stages.len(), 6);
        assert_eq!(plan.num_ticks(), 2 * (2 + 2 - 1) + 1);
        assert_eq!(plan.num_meshes, 2);
        assert!(plan.stages.iter().all(|s| s.memory_per_device > 0));

        let decoded = decode_plan(&encode_plan(&plan).unwrap()).unwrap();
        assert_eq!(decoded, plan);
    }

    #[test]
    fn memory_budget_is_enforced() {
        let cfg = PipelineConfig {
            memory_budget_per_device: Some(1),
            ..config(Some(2), true)
        };
        let err = compile_mlp(&cfg).err().unwrap();
        assert!(matches!(err, PipelineError::Compile(_)), "{err}");
    }

    #[test]
    fn unset_micro_batches_defaults_to_one() {
        let pipeline = compile_mlp(&config(None, true)).unwrap();
        assert_eq!(pipeline.num_micro_batches(), 1);
        assert_eq!(pipeline.schedule().num_ticks(), 5);
    }

    #[tokio::test]
    async fn step_without_barrier_runs_linear_pipeline() {
        let step = forward_backward(None);
        let reference = (step.arena.clone(), step.graph.clone());
        let pipeline = compile_pipeline(
            step,
            &VirtualMesh::new(1, 1),
            &config(Some(1), true),
            &InterpreterCompiler,
            Arc::new(LocalProvisioner),
        )
        .unwrap();
        assert_eq!(pipeline.stages().len(), 2);
        assert_eq!(pipeline.schedule().num_ticks(), 2);

        let args = vec![
            Tensor::new(vec![2, 2], vec![1.0, -2.0, 3.0, 0.5]).unwrap(),
            Tensor::new(vec![2, 2], vec![0.5, 1.0, -1.0, 2.0]).unwrap(),
        ];
        let out = pipeline.run(args.clone()).await.unwrap();
        let expected = eval_graph(&reference.0, &reference.1, &args).unwrap();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn stage_reading_a_routed_value_twice_runs() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", &[2]).unwrap();
        let s = b.stage_start("a", None, &[&x]);
        let h = b.op(Primitive::Scale(2.0), &[&s[0]]).unwrap();
        let e = b.stage_end("a", &[&h]);
        let s = b.stage_start("b", None, &[&e[0]]);
        let z = b.op(Primitive::Add, &[&s[0], &e[0]]).unwrap();
        let e = b.stage_end("b", &[&z]);
        let (arena, graph) = b.finish(&[&e[0]]);
        let step = TrainStep {
            arena,
            graph,
            donated_invars: vec![true],
            batch_invars: vec![false],
        };

        let pipeline = compile_pipeline(
            step,
            &VirtualMesh::new(1, 1),
            &config(Some(1), true),
            &InterpreterCompiler,
            Arc::new(LocalProvisioner),
        )
        .unwrap();
        let reader = &pipeline.stages()[1];
        assert_eq!(reader.invars.len(), 1);

        let x_val = Tensor::new(vec![2], vec![-0.5, -1.0]).unwrap();
        let out = pipeline.run(vec![x_val]).await.unwrap();
        assert_eq!(out[0].data(), &[-2.0, -4.0]);
    }

    #[tokio::test]
    async fn wrong_argument_count_fails() {
        let pipeline = compile_mlp(&config(Some(2), true)).unwrap();
        let err = pipeline.run(Vec::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Execution(_)));
    }

    #[test]
    fn pinned_mesh_conflict_fails() {
        let err = compile_pipeline(
            forward_backward(Some(1)),
            &VirtualMesh::new(1, 1),
            &config(Some(1), true),
            &InterpreterCompiler,
            Arc::new(LocalProvisioner),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Mesh(_)));
    }

    #[test]
    fn mismatched_flags_fail() {
        let mut step = forward_backward(None);
        step.batch_invars.pop();
        let err = compile_pipeline(
            step,
            &VirtualMesh::new(1, 1),
            &config(Some(1), true),
            &InterpreterCompiler,
            Arc::new(LocalProvisioner),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Transform(_)));
    }
}
