//! `stagemesh-pipeline` — Pipeline-parallel training on device meshes.
//!
//! A traced training step carries stage markers and one gradient barrier.
//! This crate cuts it into stages, pairs each forward stage with its
//! backward stage on the same mesh, accumulates gradients over
//! micro-batches, and drives the result with a GPipe schedule.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── Mesh 0 ─────────────────────────────┐
//! │  layer_0 (fwd)  ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ▶  layer_0 (bwd)  │──▶ apply_grad_0
//! └───────┬─────────────────────────────────────────────▲───────────┘
//!         │ activations                                 │ gradients
//! ┌───────▼──────────────────── Mesh 1 ─────────────────┴───────────┐
//! │  layer_1 (fwd)  ────────────────────────────────▶  layer_1 (bwd) │──▶ apply_grad_1
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The compute backend is pluggable through [`StageCompiler`] and
//! [`MeshProvisioner`]; [`InterpreterCompiler`] and [`LocalProvisioner`]
//! run everything on the host.

pub mod accumulate;
pub mod apply;
pub mod builder;
pub mod compiler;
pub mod dependency;
pub mod donation;
pub mod error;
pub mod graph;
pub mod interpreter;
pub mod mesh;
pub mod runtime;
pub mod scheduler;
pub mod stage;
pub mod transport;
pub mod workloads;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use builder::{compile_pipeline, TrainStep};
pub use compiler::{CompileRequest, CompiledStage, StageCompiler, StageExecutable};
pub use dependency::DependencyGraph;
pub use donation::split_donate_invars;
pub use error::{PipelineError, Result};
pub use graph::{Eqn, EqnArena, EqnId, EqnKind, Graph, GraphBuilder, Primitive, Var};
pub use interpreter::{eval_graph, InterpreterCompiler};
pub use mesh::{LocalProvisioner, MeshFactory, MeshProvisioner, PhysicalMesh};
pub use runtime::Pipeline;
pub use scheduler::{GpipeSchedule, Task};
pub use stage::Stage;
pub use transport::{decode_plan, encode_plan};
