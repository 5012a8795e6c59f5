//! Pipeline stages and the passes that carve them out of a traced graph.
//!
//! 1. [`slice_by_markers`] cuts the equation list at start/end markers.
//! 2. [`backfill_missing_vars`] routes every cross-stage value through the
//!    stage markers, so each stage is closed over its declared boundary.
//! 3. [`eliminate_dead_code`] drops outputs and equations nothing reads.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::graph::{push_unique, Eqn, EqnArena, EqnId, EqnKind, Graph, Var};

// ── Stage ─────────────────────────────────────────────────────────────────────

/// A contiguous slice of the computation. `eqns` always starts with the
/// stage-start marker and ends with the matching stage-end marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub mesh: Option<usize>,
    pub invars: Vec<Var>,
    pub outvars: Vec<Var>,
    pub eqns: Vec<EqnId>,
    donation: Option<Vec<bool>>,
}

impl Stage {
    /// Build a stage from an equation list framed by its markers.
    pub fn from_eqns(arena: &EqnArena, eqns: Vec<EqnId>) -> Result<Self> {
        let (first, last) = match (eqns.first(), eqns.last()) {
            (Some(f), Some(l)) if eqns.len() >= 2 => (arena.get(*f), arena.get(*l)),
            _ => {
                return Err(PipelineError::Transform(
                    "a stage needs at least its start and end markers".into(),
                ))
            }
        };
        let (name, mesh) = match &first.kind {
            EqnKind::StageStart { name, mesh } => (name.clone(), *mesh),
            _ => {
                return Err(PipelineError::Transform(format!(
                    "stage does not open with a start marker: {first}"
                )))
            }
        };
        match &last.kind {
            EqnKind::StageEnd { name: end } if *end == name => {}
            _ => {
                return Err(PipelineError::Transform(format!(
                    "stage {name} does not close with its end marker: {last}"
                )))
            }
        }

        Ok(Self {
            name,
            mesh,
            invars: first.invars.clone(),
            outvars: last.outvars.iter().filter(|v| !v.is_dropped()).cloned().collect(),
            eqns,
            donation: None,
        })
    }

    pub fn start_marker<'a>(&self, arena: &'a EqnArena) -> &'a Eqn {
        arena.get(self.eqns[0])
    }

    pub fn end_marker<'a>(&self, arena: &'a EqnArena) -> &'a Eqn {
        arena.get(self.eqns[self.eqns.len() - 1])
    }

    /// Equations strictly between the two markers.
    pub fn body(&self) -> &[EqnId] {
        &self.eqns[1..self.eqns.len() - 1]
    }

    pub fn with_mesh(mut self, mesh: usize) -> Self {
        self.mesh = Some(mesh);
        self
    }

    /// Attach donation flags, one per invar.
    pub fn set_donation(&mut self, flags: Vec<bool>) -> Result<()> {
        if flags.len() != self.invars.len() {
            return Err(PipelineError::Donation(format!(
                "stage {} has {} invars but {} donation flags",
                self.name,
                self.invars.len(),
                flags.len()
            )));
        }
        self.donation = Some(flags);
        Ok(())
    }

    pub fn donation(&self) -> Option<&[bool]> {
        self.donation.as_deref()
    }

    /// Vars the stage defines, markers included.
    pub fn defined_vars(&self, arena: &EqnArena) -> HashSet<Var> {
        self.eqns
            .iter()
            .flat_map(|id| arena.get(*id).outvars.iter())
            .filter(|v| !v.is_dropped())
            .cloned()
            .collect()
    }
}

/// Concatenate stages back into one graph.
pub fn stages_to_graph(stages: &[Stage], invars: Vec<Var>, outvars: Vec<Var>) -> Graph {
    Graph::new(
        invars,
        outvars,
        stages.iter().flat_map(|s| s.eqns.iter().copied()).collect(),
    )
}

/// Stage `i` of `n` runs on mesh `i` going forward and on mesh `n-1-i`
/// coming back, so each mesh holds a forward stage and its backward twin.
pub fn mirrored_stage_to_mesh(num_stages: usize) -> Vec<usize> {
    (0..num_stages)
        .map(|i| if 2 * i < num_stages { i } else { num_stages - 1 - i })
        .collect()
}

// ── Slicing ───────────────────────────────────────────────────────────────────

/// Cut `graph` into stages at its start/end markers.
///
/// Every equation must sit inside exactly one stage.
pub fn slice_by_markers(arena: &EqnArena, graph: &Graph) -> Result<Vec<Stage>> {
    let mut stages = Vec::new();
    let mut current: Option<(String, Vec<EqnId>)> = None;

    for &id in &graph.eqns {
        let eqn = arena.get(id);
        match &eqn.kind {
            EqnKind::StageStart { name, .. } => {
                if let Some((open, _)) = &current {
                    return Err(PipelineError::Transform(format!(
                        "stage {name} starts inside open stage {open}"
                    )));
                }
                current = Some((name.clone(), vec![id]));
            }
            EqnKind::StageEnd { name } => {
                let Some((open, mut eqns)) = current.take() else {
                    return Err(PipelineError::Transform(format!(
                        "end marker of {name} without a matching start"
                    )));
                };
                if *name != open {
                    return Err(PipelineError::Transform(format!(
                        "stage {open} closed by end marker of {name}"
                    )));
                }
                eqns.push(id);
                stages.push(Stage::from_eqns(arena, eqns)?);
            }
            _ => match current.as_mut() {
                Some((_, eqns)) => eqns.push(id),
                None => {
                    return Err(PipelineError::Transform(format!(
                        "equation outside of any pipeline stage: {eqn}"
                    )));
                }
            },
        }
    }

    if let Some((open, _)) = current {
        return Err(PipelineError::Transform(format!("stage {open} is never closed")));
    }

    debug!(num_stages = stages.len(), "sliced graph by pipeline markers");
    Ok(stages)
}

// ── Backfill ──────────────────────────────────────────────────────────────────

/// Make every stage closed over its markers.
///
/// A value read inside stage `i` but defined elsewhere is added to the
/// stage's start marker under a fresh inner name. A value defined inside a
/// stage and read by a later stage or a global output, but not exported, is
/// added to the end marker: the inner side is renamed, the outer name stays.
pub fn backfill_missing_vars(
    arena: &mut EqnArena,
    stages: Vec<Stage>,
    global_invars: &[Var],
    global_outvars: &[Var],
) -> Result<Vec<Stage>> {
    let globals: HashSet<&Var> = global_invars.iter().collect();

    // Which stage defines each variable (inner or outer).
    let mut producer: HashMap<Var, usize> = HashMap::new();
    for (i, stage) in stages.iter().enumerate() {
        for v in stage.defined_vars(arena) {
            producer.insert(v, i);
        }
    }

    let mut missing_in: Vec<Vec<Var>> = vec![Vec::new(); stages.len()];
    let mut missing_out: Vec<Vec<Var>> = vec![Vec::new(); stages.len()];

    let require_export = |v: &Var,
                          consumer: Option<usize>,
                          missing_out: &mut Vec<Vec<Var>>|
     -> Result<()> {
        match producer.get(v) {
            Some(&src) => {
                if let Some(c) = consumer {
                    if src > c {
                        return Err(PipelineError::Transform(format!(
                            "{v} is read by stage {} before stage {} defines it",
                            stages[c].name, stages[src].name
                        )));
                    }
                }
                if !stages[src].outvars.contains(v) {
                    push_unique(&mut missing_out[src], v);
                }
                Ok(())
            }
            None if globals.contains(v) => Ok(()),
            None => Err(PipelineError::Transform(format!(
                "{v} is read but never defined"
            ))),
        }
    };

    for (i, stage) in stages.iter().enumerate() {
        for v in &stage.start_marker(arena).invars {
            require_export(v, Some(i), &mut missing_out)?;
        }
        let mut local: HashSet<Var> = stage
            .start_marker(arena)
            .outvars
            .iter()
            .cloned()
            .collect();
        for &id in &stage.eqns[1..] {
            let eqn = arena.get(id);
            for v in &eqn.invars {
                if !local.contains(v) {
                    if producer.get(v) == Some(&i) {
                        return Err(PipelineError::Transform(format!(
                            "{v} is read in stage {} before it is defined",
                            stage.name
                        )));
                    }
                    require_export(v, Some(i), &mut missing_out)?;
                    push_unique(&mut missing_in[i], v);
                }
            }
            local.extend(eqn.outvars.iter().cloned());
        }
    }
    for v in global_outvars {
        require_export(v, None, &mut missing_out)?;
    }

    let mut out = Vec::with_capacity(stages.len());
    for (i, stage) in stages.into_iter().enumerate() {
        if missing_in[i].is_empty() && missing_out[i].is_empty() {
            out.push(stage);
            continue;
        }

        debug!(
            stage = %stage.name,
            added_inputs = missing_in[i].len(),
            added_outputs = missing_out[i].len(),
            "backfilled stage boundary"
        );

        let mut rename: HashMap<Var, Var> = HashMap::new();
        let mut start = stage.start_marker(arena).clone();
        for v in &missing_in[i] {
            // Already routed through the marker: read the existing inner var.
            if let Some(pos) = start.invars.iter().position(|s| s == v) {
                rename.insert(v.clone(), start.outvars[pos].clone());
                continue;
            }
            let inner = arena.fresh_like(v);
            start.invars.push(v.clone());
            start.outvars.push(inner.clone());
            rename.insert(v.clone(), inner);
        }
        let mut end_extra = Vec::new();
        for v in &missing_out[i] {
            let inner = arena.fresh_like(v);
            end_extra.push((inner.clone(), v.clone()));
            rename.insert(v.clone(), inner);
        }

        let mut eqns = Vec::with_capacity(stage.eqns.len());
        eqns.push(arena.replace(stage.eqns[0], start));
        for &id in stage.body() {
            let eqn = arena.get(id).substituted(&rename, true);
            eqns.push(arena.replace(id, eqn));
        }
        let end_id = stage.eqns[stage.eqns.len() - 1];
        let mut end = arena.get(end_id).substituted(&rename, false);
        for (inner, outer) in end_extra {
            end.invars.push(inner);
            end.outvars.push(outer);
        }
        eqns.push(arena.replace(end_id, end));

        let mesh = stage.mesh;
        let mut rebuilt = Stage::from_eqns(arena, eqns)?;
        rebuilt.mesh = mesh;
        out.push(rebuilt);
    }
    Ok(out)
}

// ── Dead-code elimination ─────────────────────────────────────────────────────

/// Remove stage outputs, equations and inputs that neither a later stage nor
/// a global output reads. Running it twice is the same as running it once.
pub fn eliminate_dead_code(
    arena: &mut EqnArena,
    stages: Vec<Stage>,
    global_outvars: &[Var],
) -> Result<Vec<Stage>> {
    let mut used: HashSet<Var> = global_outvars.iter().cloned().collect();
    let mut rev = Vec::with_capacity(stages.len());

    for stage in stages.into_iter().rev() {
        let end_id = stage.eqns[stage.eqns.len() - 1];
        let end = arena.get(end_id).clone();
        let (end_in, end_out): (Vec<Var>, Vec<Var>) = end
            .invars
            .iter()
            .zip(&end.outvars)
            .filter(|(_, o)| used.contains(*o))
            .map(|(i, o)| (i.clone(), o.clone()))
            .unzip();

        let mut local: HashSet<Var> = end_in.iter().cloned().collect();
        let mut body = Vec::new();
        for &id in stage.body().iter().rev() {
            let eqn = arena.get(id);
            let live = eqn
                .outvars
                .iter()
                .any(|v| !v.is_dropped() && local.contains(v));
            if live {
                local.extend(eqn.invars.iter().cloned());
                body.push(id);
            }
        }
        body.reverse();

        let start_id = stage.eqns[0];
        let start = arena.get(start_id).clone();
        let (start_in, start_out): (Vec<Var>, Vec<Var>) = start
            .invars
            .iter()
            .zip(&start.outvars)
            .filter(|(_, o)| local.contains(*o))
            .map(|(i, o)| (i.clone(), o.clone()))
            .unzip();

        used.extend(start_in.iter().cloned());

        let mut eqns = Vec::with_capacity(body.len() + 2);
        eqns.push(arena.replace(
            start_id,
            Eqn {
                kind: start.kind,
                invars: start_in,
                outvars: start_out,
            },
        ));
        eqns.extend(body);
        eqns.push(arena.replace(
            end_id,
            Eqn {
                kind: end.kind,
                invars: end_in,
                outvars: end_out,
            },
        ));

        let mesh = stage.mesh;
        let mut rebuilt = Stage::from_eqns(arena, eqns)?;
        rebuilt.mesh = mesh;
        rev.push(rebuilt);
    }

    rev.reverse();
    Ok(rev)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
