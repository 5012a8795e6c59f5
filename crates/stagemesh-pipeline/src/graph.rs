//! Dataflow IR: variables, primitives, equations and graphs.
//!
//! Equations are immutable records in an append-only [`EqnArena`]. A
//! [`Graph`] is an ordered list of [`EqnId`]s plus its boundary variables.
//! Rewrites push new records and build new lists; an equation that a pass
//! leaves untouched keeps its id.
//!
//! ```text
//!   x, w ──▶ [StageStart "layer_0"] ──▶ x', w' ──▶ matmul ──▶ h ──▶ [StageEnd] ──▶ h_out
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

const DROPPED: &str = "_";
const FRESH_PREFIX: char = '%';

// ── Var ───────────────────────────────────────────────────────────────────────

/// Named value slot. Identity, ordering and hashing use the name only.
#[derive(Clone, Serialize, Deserialize)]
pub struct Var {
    name: String,
    shape: Vec<usize>,
}

impl Var {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// Placeholder for an equation output nobody reads.
    pub fn dropped() -> Self {
        Self::new(DROPPED, Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn is_dropped(&self) -> bool {
        self.name == DROPPED
    }

    pub fn size_bytes(&self) -> u64 {
        self.shape
            .iter()
            .fold(std::mem::size_of::<f32>() as u64, |acc, d| acc.saturating_mul(*d as u64))
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Var {}

impl Hash for Var {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for Var {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Var {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.name, self.shape)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ── Primitive ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Primitive {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Relu,
    /// `1` where the input is positive, `0` elsewhere.
    Step,
    /// Multiply by a constant.
    Scale(f32),
    /// `[m, k] x [k, n] -> [m, n]`
    MatMul,
    /// 2-D transpose.
    Transpose,
    /// Sum over one axis, or over everything when `axis` is `None`.
    ReduceSum { axis: Option<usize> },
    Identity,
}

impl Primitive {
    pub fn arity(&self) -> usize {
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::MatMul => 2,
            _ => 1,
        }
    }

    /// Output shape for the given input shapes.
    pub fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        if inputs.len() != self.arity() {
            return Err(PipelineError::Graph(format!(
                "{self} takes {} operand(s), got {}",
                self.arity(),
                inputs.len()
            )));
        }
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Div => {
                let (a, b) = (inputs[0], inputs[1]);
                if a == b || b.iter().product::<usize>() == 1 {
                    Ok(a.to_vec())
                } else if a.iter().product::<usize>() == 1 {
                    Ok(b.to_vec())
                } else {
                    Err(PipelineError::Graph(format!(
                        "{self}: incompatible shapes {a:?} and {b:?}"
                    )))
                }
            }
            Self::MatMul => match (inputs[0], inputs[1]) {
                ([m, k1], [k2, n]) if k1 == k2 => Ok(vec![*m, *n]),
                (a, b) => Err(PipelineError::Graph(format!(
                    "matmul: incompatible shapes {a:?} and {b:?}"
                ))),
            },
            Self::Transpose => match inputs[0] {
                [r, c] => Ok(vec![*c, *r]),
                s => Err(PipelineError::Graph(format!(
                    "transpose expects a 2-D operand, got {s:?}"
                ))),
            },
            Self::ReduceSum { axis: None } => Ok(Vec::new()),
            Self::ReduceSum { axis: Some(axis) } => {
                let s = inputs[0];
                if *axis >= s.len() {
                    return Err(PipelineError::Graph(format!(
                        "reduce_sum axis {axis} out of range for {s:?}"
                    )));
                }
                let mut out = s.to_vec();
                out.remove(*axis);
                Ok(out)
            }
            Self::Neg | Self::Relu | Self::Step | Self::Scale(_) | Self::Identity => {
                Ok(inputs[0].to_vec())
            }
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Sub => write!(f, "sub"),
            Self::Mul => write!(f, "mul"),
            Self::Div => write!(f, "div"),
            Self::Neg => write!(f, "neg"),
            Self::Relu => write!(f, "relu"),
            Self::Step => write!(f, "step"),
            Self::Scale(c) => write!(f, "scale[{c}]"),
            Self::MatMul => write!(f, "matmul"),
            Self::Transpose => write!(f, "transpose"),
            Self::ReduceSum { axis: Some(a) } => write!(f, "reduce_sum[{a}]"),
            Self::ReduceSum { axis: None } => write!(f, "reduce_sum"),
            Self::Identity => write!(f, "identity"),
        }
    }
}

// ── Equation ──────────────────────────────────────────────────────────────────

/// What an equation does. Markers are identity maps from inputs to outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EqnKind {
    Op(Primitive),
    /// Opens a pipeline stage. `mesh` pins the stage to a mesh when known.
    StageStart { name: String, mesh: Option<usize> },
    /// Closes the pipeline stage of the same name.
    StageEnd { name: String },
    /// Separates gradient computation from gradient application.
    GradBarrier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eqn {
    pub kind: EqnKind,
    pub invars: Vec<Var>,
    pub outvars: Vec<Var>,
}

impl Eqn {
    pub fn op(prim: Primitive, invars: Vec<Var>, outvar: Var) -> Self {
        Self {
            kind: EqnKind::Op(prim),
            invars,
            outvars: vec![outvar],
        }
    }

    pub fn is_marker(&self) -> bool {
        !matches!(self.kind, EqnKind::Op(_))
    }

    pub fn is_stage_start(&self) -> bool {
        matches!(self.kind, EqnKind::StageStart { .. })
    }

    pub fn is_stage_end(&self) -> bool {
        matches!(self.kind, EqnKind::StageEnd { .. })
    }

    pub fn is_grad_barrier(&self) -> bool {
        matches!(self.kind, EqnKind::GradBarrier)
    }

    /// Copy with variables substituted through `map`. Outputs are only
    /// rewritten when `outvars` is set.
    pub fn substituted(&self, map: &HashMap<Var, Var>, outvars: bool) -> Eqn {
        let sub = |v: &Var| map.get(v).cloned().unwrap_or_else(|| v.clone());
        Eqn {
            kind: self.kind.clone(),
            invars: self.invars.iter().map(sub).collect(),
            outvars: if outvars {
                self.outvars.iter().map(sub).collect()
            } else {
                self.outvars.clone()
            },
        }
    }
}

impl fmt::Display for Eqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |vs: &[Var]| {
            vs.iter()
                .map(|v| v.name().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let head = match &self.kind {
            EqnKind::Op(p) => p.to_string(),
            EqnKind::StageStart { name, mesh: Some(m) } => format!("stage_start[{name}@{m}]"),
            EqnKind::StageStart { name, mesh: None } => format!("stage_start[{name}]"),
            EqnKind::StageEnd { name } => format!("stage_end[{name}]"),
            EqnKind::GradBarrier => "grad_barrier".to_string(),
        };
        write!(f, "{} = {head}({})", join(&self.outvars), join(&self.invars))
    }
}

// ── Arena ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EqnId(u32);

impl EqnId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Append-only store of equations. Also mints fresh variable names, which
/// all start with `%`, which [`GraphBuilder::input`] refuses for inputs.
#[derive(Debug, Clone, Default)]
pub struct EqnArena {
    eqns: Vec<Eqn>,
    next_var: u64,
}

impl EqnArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, eqn: Eqn) -> EqnId {
        self.eqns.push(eqn);
        EqnId((self.eqns.len() - 1) as u32)
    }

    pub fn get(&self, id: EqnId) -> &Eqn {
        &self.eqns[id.index()]
    }

    /// Reuse `id` when `eqn` equals the stored record, otherwise append.
    pub fn replace(&mut self, id: EqnId, eqn: Eqn) -> EqnId {
        if *self.get(id) == eqn {
            id
        } else {
            self.push(eqn)
        }
    }

    pub fn len(&self) -> usize {
        self.eqns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eqns.is_empty()
    }

    pub fn fresh_var(&mut self, shape: Vec<usize>) -> Var {
        let name = format!("{FRESH_PREFIX}{}", self.next_var);
        self.next_var += 1;
        Var::new(name, shape)
    }

    pub fn fresh_like(&mut self, var: &Var) -> Var {
        self.fresh_var(var.shape().to_vec())
    }
}

// ── Graph ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    pub invars: Vec<Var>,
    pub outvars: Vec<Var>,
    pub eqns: Vec<EqnId>,
}

impl Graph {
    pub fn new(invars: Vec<Var>, outvars: Vec<Var>, eqns: Vec<EqnId>) -> Self {
        Self {
            invars,
            outvars,
            eqns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.eqns.is_empty()
    }

    /// Every non-dropped variable some equation of this graph defines.
    pub fn defined_vars(&self, arena: &EqnArena) -> HashSet<Var> {
        self.eqns
            .iter()
            .flat_map(|id| arena.get(*id).outvars.iter())
            .filter(|v| !v.is_dropped())
            .cloned()
            .collect()
    }

    /// Variables read before (or without) being defined, in first-use order.
    pub fn free_vars(&self, arena: &EqnArena) -> Vec<Var> {
        free_vars(self.eqns.iter().map(|id| arena.get(*id)))
    }

    pub fn render(&self, arena: &EqnArena) -> String {
        let mut out = format!(
            "graph({}) -> ({})\n",
            names(&self.invars),
            names(&self.outvars)
        );
        for id in &self.eqns {
            out.push_str(&format!("  {}\n", arena.get(*id)));
        }
        out
    }
}

/// Variables an equation sequence reads before defining, in first-use order.
pub(crate) fn free_vars<'a>(eqns: impl IntoIterator<Item = &'a Eqn>) -> Vec<Var> {
    let mut defined = HashSet::new();
    let mut free = Vec::new();
    let mut seen = HashSet::new();
    for eqn in eqns {
        for v in &eqn.invars {
            if !defined.contains(v) && seen.insert(v.clone()) {
                free.push(v.clone());
            }
        }
        defined.extend(eqn.outvars.iter().filter(|v| !v.is_dropped()).cloned());
    }
    free
}

pub(crate) fn push_unique(list: &mut Vec<Var>, var: &Var) {
    if !list.contains(var) {
        list.push(var.clone());
    }
}

pub(crate) fn names(vars: &[Var]) -> String {
    vars.iter()
        .map(|v| v.name().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Records a traced graph equation by equation.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    arena: EqnArena,
    invars: Vec<Var>,
    eqns: Vec<EqnId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the next global input. Names starting with `%` and the
    /// dropped placeholder `_` are reserved.
    pub fn input(&mut self, name: &str, shape: &[usize]) -> Result<Var> {
        if name == DROPPED || name.starts_with(FRESH_PREFIX) {
            return Err(PipelineError::Graph(format!(
                "input name {name:?} is reserved for generated variables"
            )));
        }
        let var = Var::new(name, shape.to_vec());
        if self.invars.contains(&var) {
            return Err(PipelineError::Graph(format!("input {name} is declared twice")));
        }
        self.invars.push(var.clone());
        Ok(var)
    }

    pub fn op(&mut self, prim: Primitive, args: &[&Var]) -> Result<Var> {
        let shapes: Vec<&[usize]> = args.iter().map(|v| v.shape()).collect();
        let shape = prim.infer_shape(&shapes)?;
        let out = self.arena.fresh_var(shape);
        let invars = args.iter().map(|v| (*v).clone()).collect();
        self.eqns.push(self.arena.push(Eqn::op(prim, invars, out.clone())));
        Ok(out)
    }

    pub fn stage_start(&mut self, name: &str, mesh: Option<usize>, vars: &[&Var]) -> Vec<Var> {
        self.marker(
            EqnKind::StageStart {
                name: name.to_string(),
                mesh,
            },
            vars,
        )
    }

    pub fn stage_end(&mut self, name: &str, vars: &[&Var]) -> Vec<Var> {
        self.marker(
            EqnKind::StageEnd {
                name: name.to_string(),
            },
            vars,
        )
    }

    pub fn grad_barrier(&mut self, vars: &[&Var]) -> Vec<Var> {
        self.marker(EqnKind::GradBarrier, vars)
    }

    fn marker(&mut self, kind: EqnKind, vars: &[&Var]) -> Vec<Var> {
        let invars: Vec<Var> = vars.iter().map(|v| (*v).clone()).collect();
        let outvars: Vec<Var> = invars.iter().map(|v| self.arena.fresh_like(v)).collect();
        self.eqns.push(self.arena.push(Eqn {
            kind,
            invars,
            outvars: outvars.clone(),
        }));
        outvars
    }

    pub fn finish(self, outvars: &[&Var]) -> (EqnArena, Graph) {
        let graph = Graph::new(
            self.invars,
            outvars.iter().map(|v| (*v).clone()).collect(),
            self.eqns,
        );
        (self.arena, graph)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_identity_is_by_name() {
        let a = Var::new("x", vec![2, 2]);
        let b = Var::new("x", vec![3]);
        assert_eq!(a, b);
        let set: HashSet<Var> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert!(Var::dropped().is_dropped());
    }

    #[test]
    fn shape_inference() {
        assert_eq!(
            Primitive::MatMul.infer_shape(&[&[4, 3], &[3, 2]]).unwrap(),
            vec![4, 2]
        );
        assert!(Primitive::MatMul.infer_shape(&[&[4, 3], &[2, 2]]).is_err());
        assert_eq!(Primitive::Add.infer_shape(&[&[], &[2, 2]]).unwrap(), vec![2, 2]);
        assert_eq!(
            Primitive::ReduceSum { axis: Some(0) }.infer_shape(&[&[4, 3]]).unwrap(),
            vec![3]
        );
        assert!(Primitive::Neg.infer_shape(&[&[1], &[1]]).is_err());
    }

    #[test]
    fn fresh_vars_are_unique() {
        let mut arena = EqnArena::new();
        let a = arena.fresh_var(vec![1]);
        let b = arena.fresh_var(vec![1]);
        assert_ne!(a, b);
        assert!(a.name().starts_with('%'));
    }

    #[test]
    fn reserved_input_names_are_rejected() {
        let mut b = GraphBuilder::new();
        assert!(matches!(b.input("%0", &[1]), Err(PipelineError::Graph(_))));
        assert!(matches!(b.input("_", &[1]), Err(PipelineError::Graph(_))));
        b.input("x", &[1]).unwrap();
        assert!(matches!(b.input("x", &[2]), Err(PipelineError::Graph(_))));

        // Minted names stay distinct from every accepted input.
        let x = Var::new("x", vec![1]);
        let y = b.op(Primitive::Neg, &[&x]).unwrap();
        assert_ne!(y, x);
    }

    #[test]
    fn size_saturates_instead_of_overflowing() {
        let huge = Var::new("h", vec![usize::MAX, usize::MAX]);
        assert_eq!(huge.size_bytes(), u64::MAX);
        assert_eq!(Var::new("s", vec![]).size_bytes(), 4);
        assert_eq!(Var::new("m", vec![3, 2]).size_bytes(), 24);
    }

    #[test]
    fn replace_keeps_id_when_unchanged() {
        let mut arena = EqnArena::new();
        let x = Var::new("x", vec![1]);
        let y = Var::new("y", vec![1]);
        let id = arena.push(Eqn::op(Primitive::Neg, vec![x.clone()], y.clone()));
        assert_eq!(arena.replace(id, arena.get(id).clone()), id);
        let other = arena.replace(id, Eqn::op(Primitive::Relu, vec![x], y));
        assert_ne!(other, id);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn builder_records_free_vars() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", &[2, 2]).unwrap();
        let w = b.input("w", &[2, 2]).unwrap();
        let y = b.op(Primitive::MatMul, &[&x, &w]).unwrap();
        let z = b.op(Primitive::Relu, &[&y]).unwrap();
        let (arena, graph) = b.finish(&[&z]);
        assert_eq!(graph.free_vars(&arena), vec![x, w]);
        assert!(graph.defined_vars(&arena).contains(&z));
        assert!(graph.render(&arena).contains("matmul"));
    }

    #[test]
    fn substitution_respects_outvar_flag() {
        let x = Var::new("x", vec![1]);
        let y = Var::new("y", vec![1]);
        let eqn = Eqn::op(Primitive::Neg, vec![x.clone()], y.clone());
        let map: HashMap<Var, Var> = [
            (x.clone(), Var::new("x2", vec![1])),
            (y.clone(), Var::new("y2", vec![1])),
        ]
        .into_iter()
        .collect();
        let only_in = eqn.substituted(&map, false);
        assert_eq!(only_in.invars[0].name(), "x2");
        assert_eq!(only_in.outvars[0].name(), "y");
        let both = eqn.substituted(&map, true);
        assert_eq!(both.outvars[0].name(), "y2");
    }
}
