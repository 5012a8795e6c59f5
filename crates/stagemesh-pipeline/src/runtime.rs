//! Pipeline runtime driver.
//!
//! Walks the GPipe schedule tick by tick. Each mesh owns a buffer store
//! keyed by `(var, micro-batch)`; a stage's inputs come from, in order:
//!
//! ```text
//!   own mesh store ──▶ other mesh store ──▶ global argument ──▶ accumulator
//!   (move if donated)  (copy)               (slice or copy)     (zeros at mb 0,
//!                                                                else previous mb)
//! ```
//!
//! Tasks of one tick collect their inputs in stage order, then run
//! concurrently on the blocking pool when configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use stagemesh_types::{PipelinePlan, StagePlan, Tensor};
use tracing::{debug, info};
use uuid::Uuid;

use crate::compiler::StageExecutable;
use crate::dependency::DependencyGraph;
use crate::error::{PipelineError, Result};
use crate::graph::Var;
use crate::mesh::PhysicalMesh;
use crate::scheduler::{GpipeSchedule, Task};
use crate::stage::Stage;

type BufferStore = HashMap<(Var, usize), Tensor>;

/// A caller argument, pre-split when it carries the batch dimension.
struct GlobalArg {
    whole: Tensor,
    parts: Option<Vec<Tensor>>,
}

impl GlobalArg {
    fn for_micro_batch(&self, micro_batch: usize) -> Tensor {
        match &self.parts {
            Some(parts) => parts[micro_batch].clone(),
            None => self.whole.clone(),
        }
    }
}

/// Compiled, runnable pipeline for one training step.
pub struct Pipeline {
    pub(crate) pipeline_id: Uuid,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) stages: Vec<Stage>,
    pub(crate) executables: Vec<Arc<dyn StageExecutable>>,
    pub(crate) memory_per_device: Vec<u64>,
    pub(crate) schedule: GpipeSchedule,
    pub(crate) dependency: DependencyGraph,
    pub(crate) meshes: Vec<Arc<dyn PhysicalMesh>>,
    pub(crate) global_invars: Vec<Var>,
    pub(crate) global_outvars: Vec<Var>,
    pub(crate) batch_invars: Vec<bool>,
    /// (accumulator input, accumulator output) for every gradient.
    pub(crate) acc_pairs: Vec<(Var, Var)>,
    pub(crate) concurrent_dispatch: bool,
}

impl Pipeline {
    // ── Accessors ────────────────────────────────────────────────────────

    pub fn pipeline_id(&self) -> Uuid {
        self.pipeline_id
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn schedule(&self) -> &GpipeSchedule {
        &self.schedule
    }

    pub fn dependency(&self) -> &DependencyGraph {
        &self.dependency
    }

    pub fn meshes(&self) -> &[Arc<dyn PhysicalMesh>] {
        &self.meshes
    }

    pub fn global_invars(&self) -> &[Var] {
        &self.global_invars
    }

    pub fn global_outvars(&self) -> &[Var] {
        &self.global_outvars
    }

    pub fn num_micro_batches(&self) -> usize {
        self.schedule.num_micro_batches()
    }

    /// Donation flags of every stage, in stage order.
    pub fn donation_table(&self) -> Vec<&[bool]> {
        self.stages
            .iter()
            .map(|s| s.donation().unwrap_or(&[]))
            .collect()
    }

    /// Serializable snapshot for diagnostics.
    pub fn plan(&self) -> PipelinePlan {
        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| StagePlan {
                stage_index: i as u32,
                name: stage.name.clone(),
                mesh_index: self.schedule.stage_placement(i).unwrap_or_default() as u32,
                invars: stage.invars.iter().map(|v| v.name().to_string()).collect(),
                outvars: stage.outvars.iter().map(|v| v.name().to_string()).collect(),
                donation: stage.donation().map(<[bool]>::to_vec).unwrap_or_default(),
                memory_per_device: self.memory_per_device.get(i).copied().unwrap_or_default(),
            })
            .collect();

        PipelinePlan {
            pipeline_id: self.pipeline_id.to_string(),
            created_at: self.created_at.to_rfc3339(),
            num_micro_batches: self.schedule.num_micro_batches() as u32,
            num_meshes: self.schedule.num_meshes() as u32,
            stages,
            ticks: self.schedule.task_slots(),
        }
    }

    // ── Execution ────────────────────────────────────────────────────────

    /// Run one training step on the full batch. Returns the global outputs
    /// in their original order, taken from the last micro-batch.
    pub async fn run(&self, args: Vec<Tensor>) -> Result<Vec<Tensor>> {
        if args.len() != self.global_invars.len() {
            return Err(PipelineError::Execution(format!(
                "pipeline takes {} arguments, got {}",
                self.global_invars.len(),
                args.len()
            )));
        }

        let started = Instant::now();
        let num_micro_batches = self.schedule.num_micro_batches();
        let globals = args
            .into_iter()
            .zip(&self.batch_invars)
            .map(|(whole, batch)| -> Result<GlobalArg> {
                let parts = if *batch {
                    Some(whole.split_batch(num_micro_batches)?)
                } else {
                    None
                };
                Ok(GlobalArg { whole, parts })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stores: Vec<BufferStore> = vec![HashMap::new(); self.schedule.num_meshes()];

        for (tick, row) in self.schedule.ticks().iter().enumerate() {
            let mut tasks: Vec<(usize, Task)> = row
                .iter()
                .enumerate()
                .filter_map(|(mesh, task)| task.map(|t| (mesh, t)))
                .collect();
            tasks.sort_by_key(|(_, t)| t.stage);

            let mut batch = Vec::with_capacity(tasks.len());
            for (mesh, task) in tasks {
                let inputs = self.gather_inputs(&mut stores, &globals, mesh, task)?;
                batch.push((mesh, task, inputs));
            }
            debug!(tick, tasks = batch.len(), "dispatching tick");

            let results = if self.concurrent_dispatch {
                let handles = batch.into_iter().map(|(mesh, task, inputs)| {
                    let executable = Arc::clone(&self.executables[task.stage]);
                    tokio::task::spawn_blocking(move || {
                        executable.execute(inputs).map(|out| (mesh, task, out))
                    })
                });
                join_all(handles)
                    .await
                    .into_iter()
                    .map(|joined| {
                        joined
                            .map_err(|e| PipelineError::Execution(format!("stage task failed: {e}")))
                            .and_then(|r| r)
                    })
                    .collect::<Result<Vec<_>>>()?
            } else {
                batch
                    .into_iter()
                    .map(|(mesh, task, inputs)| {
                        self.executables[task.stage]
                            .execute(inputs)
                            .map(|out| (mesh, task, out))
                    })
                    .collect::<Result<Vec<_>>>()?
            };

            for (mesh, task, outputs) in results {
                let stage = &self.stages[task.stage];
                if outputs.len() != stage.outvars.len() {
                    return Err(PipelineError::Execution(format!(
                        "stage {} returned {} outputs, expected {}",
                        stage.name,
                        outputs.len(),
                        stage.outvars.len()
                    )));
                }
                for (var, value) in stage.outvars.iter().zip(outputs) {
                    stores[mesh].insert((var.clone(), task.micro_batch), value);
                }
            }
        }

        let last = num_micro_batches - 1;
        let outputs = self
            .global_outvars
            .iter()
            .map(|var| {
                let key = (var.clone(), last);
                if let Some(value) = stores.iter().find_map(|s| s.get(&key)) {
                    return Ok(value.clone());
                }
                match self.global_invars.iter().position(|g| g == var) {
                    Some(i) => Ok(globals[i].whole.clone()),
                    None => Err(PipelineError::Execution(format!(
                        "global output {var} was never produced"
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            pipeline = %self.pipeline_id,
            micro_batches = num_micro_batches,
            ticks = self.schedule.num_ticks(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline run complete"
        );
        Ok(outputs)
    }

    fn gather_inputs(
        &self,
        stores: &mut [BufferStore],
        globals: &[GlobalArg],
        mesh: usize,
        task: Task,
    ) -> Result<Vec<Tensor>> {
        let stage = &self.stages[task.stage];
        let donation = stage.donation().unwrap_or(&[]);
        let mut inputs = Vec::with_capacity(stage.invars.len());

        for (i, var) in stage.invars.iter().enumerate() {
            let key = (var.clone(), task.micro_batch);

            // Own mesh: the main copy, moved out only when donated.
            if donation.get(i).copied().unwrap_or(false) {
                if let Some(value) = stores[mesh].remove(&key) {
                    inputs.push(value);
                    continue;
                }
            } else if let Some(value) = stores[mesh].get(&key) {
                inputs.push(value.clone());
                continue;
            }

            // Another mesh: always a copy.
            let remote = stores
                .iter()
                .enumerate()
                .filter(|(m, _)| *m != mesh)
                .find_map(|(_, s)| s.get(&key));
            if let Some(value) = remote {
                inputs.push(value.clone());
                continue;
            }

            if let Some(g) = self.global_invars.iter().position(|g| g == var) {
                inputs.push(globals[g].for_micro_batch(task.micro_batch));
                continue;
            }

            if let Some((_, acc_out)) = self.acc_pairs.iter().find(|(acc_in, _)| acc_in == var) {
                let value = if task.micro_batch == 0 {
                    Tensor::zeros(var.shape())
                } else {
                    let prev = (acc_out.clone(), task.micro_batch - 1);
                    stores
                        .iter_mut()
                        .find_map(|s| s.remove(&prev))
                        .ok_or_else(|| PipelineError::MissingBuffer {
                            var: acc_out.name().to_string(),
                            micro_batch: task.micro_batch - 1,
                            stage: task.stage,
                        })?
                };
                inputs.push(value);
                continue;
            }

            return Err(PipelineError::MissingBuffer {
                var: var.name().to_string(),
                micro_batch: task.micro_batch,
                stage: task.stage,
            });
        }
        Ok(inputs)
    }
}
