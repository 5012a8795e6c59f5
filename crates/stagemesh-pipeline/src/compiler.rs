//! Contract with the stage compiler.
//!
//! The compiler turns one stage into something a physical mesh can run. It
//! must honour the donation flags exactly: an input flagged `false` may be
//! read but never reused in place.

use std::sync::Arc;

use stagemesh_types::{LogicalMesh, Tensor};

use crate::error::Result;
use crate::graph::EqnArena;
use crate::mesh::PhysicalMesh;
use crate::stage::Stage;

/// A compiled stage bound to one mesh.
pub trait StageExecutable: Send + Sync {
    /// Run once. `inputs` arrive in stage invar order; outputs leave in
    /// stage outvar order.
    fn execute(&self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>>;
}

/// Everything the compiler gets to see for one stage.
pub struct CompileRequest<'a> {
    pub arena: &'a EqnArena,
    pub stage: &'a Stage,
    pub mesh_index: usize,
    pub mesh: &'a dyn PhysicalMesh,
    pub logical_mesh: LogicalMesh,
    pub donation: &'a [bool],
    pub memory_budget_per_device: Option<u64>,
}

pub struct CompiledStage {
    pub executable: Arc<dyn StageExecutable>,
    /// Estimated peak memory on each device of the mesh, in bytes.
    pub memory_per_device: u64,
}

pub trait StageCompiler: Send + Sync {
    fn compile(&self, request: CompileRequest<'_>) -> Result<CompiledStage>;
}
