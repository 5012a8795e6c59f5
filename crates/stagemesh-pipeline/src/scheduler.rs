//! Bidirectional GPipe schedule over meshes.
//!
//! With `N` meshes there are `2N` pipeline stages: stage `d` is the forward
//! half on mesh `d`, stage `2N-1-d` the backward half on the same mesh.
//!
//! ```text
//! Tick →   0      1      2      3      4      5
//! M0:    [0:0]  [0:1]    .      .    [3:0]  [3:1]
//! M1:      .    [1:0]  [1:1]  [2:0]  [2:1]    .
//!
//! [s:b] = stage s on micro-batch b       (4 stages, 2 meshes, 2 micro-batches)
//!
//! Ticks      = 2 (M + N - 1)  (+1 when apply stages exist)
//! Efficiency = busy slots / (ticks × meshes)
//! ```

use std::collections::HashMap;
use std::fmt;

use stagemesh_types::TaskSlot;
use tracing::debug;

use crate::dependency::DependencyGraph;
use crate::error::{PipelineError, Result};

/// One occupied cell of the schedule: a stage running one micro-batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Task {
    pub stage: usize,
    pub micro_batch: usize,
}

impl From<Task> for TaskSlot {
    fn from(t: Task) -> Self {
        TaskSlot {
            stage_index: t.stage as u32,
            micro_batch_index: t.micro_batch as u32,
        }
    }
}

/// Deterministic GPipe schedule. Computed once at compile time and never
/// changed afterwards.
#[derive(Debug, Clone)]
pub struct GpipeSchedule {
    num_meshes: usize,
    num_micro_batches: usize,
    /// Mesh of each stage.
    placement: Vec<usize>,
    /// `ticks[t][m]` is what mesh `m` runs at tick `t`.
    ticks: Vec<Vec<Option<Task>>>,
}

impl GpipeSchedule {
    /// Build the schedule for `dependency` on `num_meshes` meshes.
    ///
    /// `apply` lists the gradient-application stages as `(stage, mesh)`.
    /// Without them the stage count must be even; with them the pipeline
    /// stages must number exactly twice the meshes.
    pub fn new(
        dependency: &DependencyGraph,
        num_meshes: usize,
        apply: &[(usize, usize)],
        num_micro_batches: usize,
    ) -> Result<Self> {
        let num_stages = dependency.num_stages();
        if num_meshes == 0 || num_micro_batches == 0 {
            return Err(PipelineError::Scheduling(format!(
                "need at least one mesh and one micro-batch, got {num_meshes} and {num_micro_batches}"
            )));
        }
        let num_pipeline = num_stages.checked_sub(apply.len()).ok_or_else(|| {
            PipelineError::Scheduling(format!(
                "{} apply stages exceed the {num_stages} stages",
                apply.len()
            ))
        })?;
        if apply.is_empty() && num_pipeline % 2 != 0 {
            return Err(PipelineError::Scheduling(format!(
                "forward/backward pipeline needs an even stage count, got {num_pipeline}"
            )));
        }
        if num_pipeline != 2 * num_meshes {
            return Err(PipelineError::Scheduling(format!(
                "{num_pipeline} pipeline stages cannot be mirrored onto {num_meshes} meshes"
            )));
        }

        let mut placement: Vec<usize> = (0..num_pipeline)
            .map(|i| if i < num_meshes { i } else { num_pipeline - 1 - i })
            .collect();
        placement.resize(num_stages, usize::MAX);
        for &(stage, mesh) in apply {
            if stage < num_pipeline || stage >= num_stages || mesh >= num_meshes {
                return Err(PipelineError::Scheduling(format!(
                    "apply stage {stage} on mesh {mesh} is out of range"
                )));
            }
            placement[stage] = mesh;
        }
        if let Some(stage) = placement.iter().position(|m| *m == usize::MAX) {
            return Err(PipelineError::Scheduling(format!(
                "stage {stage} has no mesh assignment"
            )));
        }

        let (n, m) = (num_meshes, num_micro_batches);

        // Fill: at tick k mesh d runs stage d on micro-batch k - d.
        let forward: Vec<Vec<Option<Task>>> = (0..m + n - 1)
            .map(|k| {
                (0..n)
                    .map(|d| {
                        (d <= k && k - d < m).then(|| Task {
                            stage: d,
                            micro_batch: k - d,
                        })
                    })
                    .collect()
            })
            .collect();

        // Drain: the fill mirrored in time, stage and micro-batch.
        let backward: Vec<Vec<Option<Task>>> = forward
            .iter()
            .rev()
            .map(|row| {
                row.iter()
                    .map(|slot| {
                        slot.map(|t| Task {
                            stage: 2 * n - 1 - t.stage,
                            micro_batch: m - 1 - t.micro_batch,
                        })
                    })
                    .collect()
            })
            .collect();

        let mut ticks = forward;
        ticks.extend(backward);
        if !apply.is_empty() {
            let mut row = vec![None; n];
            for &(stage, mesh) in apply {
                if row[mesh].is_some() {
                    return Err(PipelineError::Scheduling(format!(
                        "mesh {mesh} has more than one apply stage"
                    )));
                }
                row[mesh] = Some(Task {
                    stage,
                    micro_batch: m - 1,
                });
            }
            ticks.push(row);
        }

        let schedule = Self {
            num_meshes,
            num_micro_batches,
            placement,
            ticks,
        };
        schedule.verify(dependency)?;

        debug!(
            meshes = num_meshes,
            micro_batches = num_micro_batches,
            stages = num_stages,
            ticks = schedule.num_ticks(),
            "generated GPipe schedule"
        );
        Ok(schedule)
    }

    /// Every task runs once, on its stage's mesh, after the same stage's
    /// earlier micro-batches and after its dependencies for every
    /// micro-batch up to its own. Apply stages run a single micro-batch.
    fn verify(&self, dependency: &DependencyGraph) -> Result<()> {
        let mut done_at: HashMap<Task, usize> = HashMap::new();
        for (t, row) in self.ticks.iter().enumerate() {
            for (mesh, task) in row.iter().enumerate() {
                let Some(task) = task else { continue };
                if self.placement[task.stage] != mesh {
                    return Err(PipelineError::Scheduling(format!(
                        "stage {} scheduled on mesh {mesh} but placed on mesh {}",
                        task.stage, self.placement[task.stage]
                    )));
                }
                if done_at.insert(*task, t).is_some() {
                    return Err(PipelineError::Scheduling(format!(
                        "stage {} micro-batch {} scheduled twice",
                        task.stage, task.micro_batch
                    )));
                }
            }
        }

        let num_apply = self.placement.len() - 2 * self.num_meshes;
        let expected = 2 * self.num_meshes * self.num_micro_batches + num_apply;
        if done_at.len() != expected {
            return Err(PipelineError::Scheduling(format!(
                "schedule holds {} tasks, expected {expected}",
                done_at.len()
            )));
        }

        for (task, &t) in &done_at {
            let before = |stage: usize, micro_batch: usize| {
                done_at
                    .get(&Task { stage, micro_batch })
                    .is_some_and(|&at| at < t)
            };
            if task.micro_batch > 0 {
                let prev = Task {
                    stage: task.stage,
                    micro_batch: task.micro_batch - 1,
                };
                if done_at.contains_key(&prev) && !before(prev.stage, prev.micro_batch) {
                    return Err(PipelineError::Scheduling(format!(
                        "stage {} runs micro-batch {} out of order",
                        task.stage, task.micro_batch
                    )));
                }
            }
            let deps = dependency.deps(task.stage).into_iter().flatten();
            for &dep in deps {
                if !(0..=task.micro_batch).all(|b| before(dep, b)) {
                    return Err(PipelineError::Scheduling(format!(
                        "stage {} micro-batch {} runs before its dependency stage {dep}",
                        task.stage, task.micro_batch
                    )));
                }
            }
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn num_meshes(&self) -> usize {
        self.num_meshes
    }

    pub fn num_micro_batches(&self) -> usize {
        self.num_micro_batches
    }

    pub fn num_stages(&self) -> usize {
        self.placement.len()
    }

    /// Mesh that runs `stage`.
    pub fn stage_placement(&self, stage: usize) -> Option<usize> {
        self.placement.get(stage).copied()
    }

    /// Stages placed on `mesh`, in index order.
    pub fn mesh_stages(&self, mesh: usize) -> Vec<usize> {
        self.placement
            .iter()
            .enumerate()
            .filter(|(_, m)| **m == mesh)
            .map(|(s, _)| s)
            .collect()
    }

    pub fn ticks(&self) -> &[Vec<Option<Task>>] {
        &self.ticks
    }

    pub fn num_ticks(&self) -> usize {
        self.ticks.len()
    }

    /// Ratio of busy (tick, mesh) slots to all slots.
    pub fn efficiency(&self) -> f64 {
        let total = self.ticks.len() * self.num_meshes;
        if total == 0 {
            return 0.0;
        }
        let busy = self.ticks.iter().flatten().filter(|t| t.is_some()).count();
        busy as f64 / total as f64
    }

    /// The tick table in the plan's wire form.
    pub fn task_slots(&self) -> Vec<Vec<Option<TaskSlot>>> {
        self.ticks
            .iter()
            .map(|row| row.iter().map(|t| t.map(TaskSlot::from)).collect())
            .collect()
    }
}

impl fmt::Display for GpipeSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick ")?;
        for mesh in 0..self.num_meshes {
            write!(f, " {:>7}", format!("M{mesh}"))?;
        }
        writeln!(f)?;
        for (t, row) in self.ticks.iter().enumerate() {
            write!(f, "{t:>4} ")?;
            for slot in row {
                match slot {
                    Some(task) => {
                        write!(f, " {:>7}", format!("{}:{}", task.stage, task.micro_batch))?
                    }
                    None => write!(f, " {:>7}", ".")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
