//! Stage-level "must run before" relation.
//!
//! ```text
//!   linear(4):             0 ──▶ 1 ──▶ 2 ──▶ 3
//!
//!   with apply (2 meshes): 0 ──▶ 1 ──▶ 2 ──▶ 3
//!                          │     │     │     │
//!                          │     └──┬──┘     │
//!                          │        ▼        │
//!                          │   apply(mesh 1) │
//!                          └────────┬────────┘
//!                                   ▼
//!                              apply(mesh 0)
//! ```

use std::collections::BTreeSet;

use crate::error::{PipelineError, Result};

/// Maps each stage index to the stages that must finish first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    deps: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Stage `i` depends on stage `i - 1`.
    pub fn linear(num_stages: usize) -> Self {
        let deps = (0..num_stages)
            .map(|i| {
                if i == 0 {
                    BTreeSet::new()
                } else {
                    BTreeSet::from([i - 1])
                }
            })
            .collect();
        Self { deps }
    }

    /// Linear chain over the `2 * num_meshes` pipeline stages, plus one
    /// gradient-application stage per `(stage, mesh)` entry of `apply`.
    ///
    /// An apply stage on mesh `k` depends on the forward stage `k` and the
    /// backward stage `2 * num_meshes - 1 - k`, the two pipeline stages that
    /// mesh runs.
    pub fn linear_with_apply(
        num_stages: usize,
        num_meshes: usize,
        apply: &[(usize, usize)],
    ) -> Result<Self> {
        let num_pipeline = 2 * num_meshes;
        if num_meshes == 0 || num_pipeline + apply.len() != num_stages {
            return Err(PipelineError::Dependency(format!(
                "{num_stages} stages cannot hold {num_pipeline} pipeline stages for {num_meshes} \
                 meshes plus {} apply stages",
                apply.len()
            )));
        }

        let mut graph = Self::linear(num_pipeline);
        graph.deps.resize(num_stages, BTreeSet::new());

        let mut seen = BTreeSet::new();
        for &(stage, mesh) in apply {
            if mesh >= num_meshes {
                return Err(PipelineError::Dependency(format!(
                    "apply stage {stage} refers to mesh {mesh}, but there are only {num_meshes} meshes"
                )));
            }
            if stage < num_pipeline || stage >= num_stages || !seen.insert(stage) {
                return Err(PipelineError::Dependency(format!(
                    "apply stage index {stage} is not a distinct index in {num_pipeline}..{num_stages}"
                )));
            }
            graph.deps[stage] = BTreeSet::from([mesh, num_pipeline - 1 - mesh]);
        }
        Ok(graph)
    }

    pub fn num_stages(&self) -> usize {
        self.deps.len()
    }

    /// Direct predecessors of `stage`.
    pub fn deps(&self, stage: usize) -> Option<&BTreeSet<usize>> {
        self.deps.get(stage)
    }

    pub fn depends_on(&self, stage: usize, on: usize) -> bool {
        self.deps.get(stage).is_some_and(|d| d.contains(&on))
    }

    /// Kahn's algorithm; lowest index first among ready stages.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let n = self.deps.len();
        let mut remaining: Vec<usize> = self.deps.iter().map(BTreeSet::len).collect();
        let mut users: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (stage, deps) in self.deps.iter().enumerate() {
            for &d in deps {
                if d >= n {
                    return Err(PipelineError::Dependency(format!(
                        "stage {stage} depends on unknown stage {d}"
                    )));
                }
                users[d].push(stage);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|i| remaining[*i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(stage) = ready.pop_first() {
            order.push(stage);
            for &u in &users[stage] {
                remaining[u] -= 1;
                if remaining[u] == 0 {
                    ready.insert(u);
                }
            }
        }

        if order.len() != n {
            return Err(PipelineError::Dependency(
                "stage dependencies contain a cycle".into(),
            ));
        }
        Ok(order)
    }

    pub fn is_acyclic(&self) -> bool {
        self.topological_order().is_ok()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
