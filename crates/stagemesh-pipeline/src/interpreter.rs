//! Reference backend: evaluates equations directly on host tensors.
//!
//! Serves as the stage compiler for local runs and as the oracle that
//! pipelined results are checked against.

use std::collections::HashMap;
use std::sync::Arc;

use stagemesh_types::Tensor;

use crate::compiler::{CompileRequest, CompiledStage, StageCompiler, StageExecutable};
use crate::error::{PipelineError, Result};
use crate::graph::{Eqn, EqnArena, EqnKind, Graph, Primitive, Var};

// ── Primitive evaluation ──────────────────────────────────────────────────────

fn binary(prim: &Primitive, a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
    let data: Vec<f32> = if a.shape() == b.shape() {
        a.data().iter().zip(b.data()).map(|(x, y)| f(*x, *y)).collect()
    } else if b.numel() == 1 {
        let y = b.data()[0];
        a.data().iter().map(|x| f(*x, y)).collect()
    } else if a.numel() == 1 {
        let x = a.data()[0];
        b.data().iter().map(|y| f(x, *y)).collect()
    } else {
        return Err(PipelineError::Execution(format!(
            "{prim}: incompatible shapes {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    };
    let shape = if a.shape() == b.shape() || b.numel() == 1 {
        a.shape().to_vec()
    } else {
        b.shape().to_vec()
    };
    Ok(Tensor::new(shape, data)?)
}

fn unary(a: &Tensor, f: impl Fn(f32) -> f32) -> Result<Tensor> {
    Ok(Tensor::new(a.shape().to_vec(), a.data().iter().map(|x| f(*x)).collect())?)
}

fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (m, k, n) = match (a.shape(), b.shape()) {
        ([m, k1], [k2, n]) if k1 == k2 => (*m, *k1, *n),
        (sa, sb) => {
            return Err(PipelineError::Execution(format!(
                "matmul: incompatible shapes {sa:?} and {sb:?}"
            )))
        }
    };
    let (ad, bd) = (a.data(), b.data());
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let x = ad[i * k + p];
            for j in 0..n {
                out[i * n + j] += x * bd[p * n + j];
            }
        }
    }
    Ok(Tensor::new(vec![m, n], out)?)
}

fn transpose(a: &Tensor) -> Result<Tensor> {
    let [r, c] = a.shape() else {
        return Err(PipelineError::Execution(format!(
            "transpose expects a 2-D operand, got {:?}",
            a.shape()
        )));
    };
    let (r, c) = (*r, *c);
    let d = a.data();
    let mut out = vec![0.0; r * c];
    for i in 0..r {
        for j in 0..c {
            out[j * r + i] = d[i * c + j];
        }
    }
    Ok(Tensor::new(vec![c, r], out)?)
}

fn reduce_sum(a: &Tensor, axis: Option<usize>) -> Result<Tensor> {
    let Some(axis) = axis else {
        return Ok(Tensor::scalar(a.data().iter().sum()));
    };
    let shape = a.shape();
    if axis >= shape.len() {
        return Err(PipelineError::Execution(format!(
            "reduce_sum axis {axis} out of range for {shape:?}"
        )));
    }
    let outer: usize = shape[..axis].iter().product();
    let len = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let d = a.data();
    let mut out = vec![0.0; outer * inner];
    for o in 0..outer {
        for j in 0..len {
            for i in 0..inner {
                out[o * inner + i] += d[(o * len + j) * inner + i];
            }
        }
    }
    let mut out_shape = shape.to_vec();
    out_shape.remove(axis);
    Ok(Tensor::new(out_shape, out)?)
}

pub fn eval_primitive(prim: &Primitive, args: &[&Tensor]) -> Result<Tensor> {
    if args.len() != prim.arity() {
        return Err(PipelineError::Execution(format!(
            "{prim} takes {} operand(s), got {}",
            prim.arity(),
            args.len()
        )));
    }
    match prim {
        Primitive::Add => binary(prim, args[0], args[1], |x, y| x + y),
        Primitive::Sub => binary(prim, args[0], args[1], |x, y| x - y),
        Primitive::Mul => binary(prim, args[0], args[1], |x, y| x * y),
        Primitive::Div => binary(prim, args[0], args[1], |x, y| x / y),
        Primitive::Neg => unary(args[0], |x| -x),
        Primitive::Relu => unary(args[0], |x| x.max(0.0)),
        Primitive::Step => unary(args[0], |x| if x > 0.0 { 1.0 } else { 0.0 }),
        Primitive::Scale(c) => {
            let c = *c;
            unary(args[0], move |x| x * c)
        }
        Primitive::MatMul => matmul(args[0], args[1]),
        Primitive::Transpose => transpose(args[0]),
        Primitive::ReduceSum { axis } => reduce_sum(args[0], *axis),
        Primitive::Identity => Ok(args[0].clone()),
    }
}

/// Evaluate one equation against `env`, binding its outputs.
fn eval_eqn(eqn: &Eqn, env: &mut HashMap<Var, Tensor>) -> Result<()> {
    let args = eqn
        .invars
        .iter()
        .map(|v| {
            env.get(v).ok_or_else(|| {
                PipelineError::Execution(format!("{v} is unbound when evaluating {eqn}"))
            })
        })
        .collect::<Result<Vec<&Tensor>>>()?;

    let results = match &eqn.kind {
        EqnKind::Op(prim) => vec![eval_primitive(prim, &args)?],
        // Markers forward their inputs unchanged.
        _ => args.into_iter().cloned().collect(),
    };

    for (var, value) in eqn.outvars.iter().zip(results) {
        if !var.is_dropped() {
            env.insert(var.clone(), value);
        }
    }
    Ok(())
}

fn eval_eqns<'a>(
    eqns: impl IntoIterator<Item = &'a Eqn>,
    invars: &[Var],
    outvars: &[Var],
    args: Vec<Tensor>,
) -> Result<Vec<Tensor>> {
    if args.len() != invars.len() {
        return Err(PipelineError::Execution(format!(
            "expected {} argument(s), got {}",
            invars.len(),
            args.len()
        )));
    }
    let mut env: HashMap<Var, Tensor> = invars.iter().cloned().zip(args).collect();
    for eqn in eqns {
        eval_eqn(eqn, &mut env)?;
    }
    outvars
        .iter()
        .map(|v| {
            env.get(v)
                .cloned()
                .ok_or_else(|| PipelineError::Execution(format!("output {v} was never computed")))
        })
        .collect()
}

/// Evaluate a whole graph on one device, with no pipelining.
pub fn eval_graph(arena: &EqnArena, graph: &Graph, args: &[Tensor]) -> Result<Vec<Tensor>> {
    eval_eqns(
        graph.eqns.iter().map(|id| arena.get(*id)),
        &graph.invars,
        &graph.outvars,
        args.to_vec(),
    )
}

// ── Stage executable ──────────────────────────────────────────────────────────

/// A stage snapshot that evaluates its equations on the host.
#[derive(Debug, Clone)]
pub struct InterpretedStage {
    pub name: String,
    invars: Vec<Var>,
    outvars: Vec<Var>,
    eqns: Vec<Eqn>,
}

impl InterpretedStage {
    pub fn new(arena: &EqnArena, stage: &crate::stage::Stage) -> Self {
        Self {
            name: stage.name.clone(),
            invars: stage.invars.clone(),
            outvars: stage.outvars.clone(),
            eqns: stage.eqns.iter().map(|id| arena.get(*id).clone()).collect(),
        }
    }

    /// Bytes touched by the stage: every input plus every defined value.
    pub fn footprint_bytes(&self) -> u64 {
        let inputs: u64 = self.invars.iter().map(Var::size_bytes).sum();
        let defined: u64 = self
            .eqns
            .iter()
            .filter(|e| !e.is_marker())
            .flat_map(|e| e.outvars.iter())
            .map(Var::size_bytes)
            .sum();
        inputs + defined
    }
}

impl StageExecutable for InterpretedStage {
    fn execute(&self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        eval_eqns(&self.eqns, &self.invars, &self.outvars, inputs)
            .map_err(|e| PipelineError::Execution(format!("stage {}: {e}", self.name)))
    }
}

/// Compiles stages into [`InterpretedStage`]s. The memory estimate spreads
/// the stage footprint evenly over the mesh's devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterpreterCompiler;

impl StageCompiler for InterpreterCompiler {
    fn compile(&self, request: CompileRequest<'_>) -> Result<CompiledStage> {
        let stage = InterpretedStage::new(request.arena, request.stage);
        let devices = request.mesh.num_devices().max(1) as u64;
        let memory_per_device = stage.footprint_bytes().div_ceil(devices);
        Ok(CompiledStage {
            executable: Arc::new(stage),
            memory_per_device,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
