//! Buffer donation analysis.
//!
//! Stages are grouped per mesh. Inside a group they run serially, across
//! groups in parallel. A value produced on a mesh is that mesh's main copy;
//! other meshes only ever see copies of it.
//!
//! An input may be donated (destroyed after use) unless:
//! - the caller did not donate it,
//! - the same stage reads it again further down its input list,
//! - a later stage of the same group reads it again, or
//! - it is a main copy and some stage on any mesh reads it later.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::graph::Var;
use crate::stage::Stage;

/// Donation flags for every stage, parallel to its invars.
///
/// `pattern` lists the stage indices of each mesh group. Every stage must
/// appear in exactly one group.
pub fn split_donate_invars(
    donated: &[bool],
    global_invars: &[Var],
    stages: &[Stage],
    pattern: &[Vec<usize>],
) -> Result<Vec<Vec<bool>>> {
    if donated.len() != global_invars.len() {
        return Err(PipelineError::Donation(format!(
            "{} donation flags for {} global inputs",
            donated.len(),
            global_invars.len()
        )));
    }

    let not_donated: HashSet<&Var> = global_invars
        .iter()
        .zip(donated)
        .filter(|(_, d)| !**d)
        .map(|(v, _)| v)
        .collect();

    // Last stage, by global index, that reads each var.
    let mut global_last_use: HashMap<&Var, usize> = HashMap::new();
    for (idx, stage) in stages.iter().enumerate() {
        for v in &stage.invars {
            global_last_use.insert(v, idx);
        }
    }

    let mut result: Vec<Option<Vec<bool>>> = vec![None; stages.len()];
    for group in pattern {
        let mut group = group.clone();
        group.sort_unstable();

        let mut main_copy_vars: HashSet<&Var> = HashSet::new();
        for &idx in &group {
            let stage = stages.get(idx).ok_or_else(|| {
                PipelineError::Donation(format!("pattern names unknown stage {idx}"))
            })?;
            main_copy_vars.extend(stage.outvars.iter());
        }

        let mut use_later: HashSet<&Var> = HashSet::new();
        for &idx in group.iter().rev() {
            let invars = &stages[idx].invars;
            // Walk the invars backwards too, so only the last read of a
            // repeated input may donate it.
            let mut read_after: HashSet<&Var> = HashSet::new();
            let mut flags: Vec<bool> = invars
                .iter()
                .rev()
                .map(|v| {
                    let repeated = !read_after.insert(v);
                    if repeated || not_donated.contains(v) || use_later.contains(v) {
                        false
                    } else {
                        !(main_copy_vars.contains(v) && global_last_use[v] > idx)
                    }
                })
                .collect();
            flags.reverse();
            use_later.extend(invars.iter());

            if result[idx].replace(flags).is_some() {
                return Err(PipelineError::Donation(format!(
                    "stage {idx} appears in more than one group"
                )));
            }
        }
    }

    let flags = result
        .into_iter()
        .enumerate()
        .map(|(idx, flags)| {
            flags.ok_or_else(|| {
                PipelineError::Donation(format!("stage {idx} is not in any group"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        stages = flags.len(),
        donated = flags.iter().flatten().filter(|d| **d).count(),
        "split donation flags"
    );
    Ok(flags)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Eqn, EqnArena, EqnKind};

    fn v(name: &str) -> Var {
        Var::new(name, vec![1])
    }

    fn stage(arena: &mut EqnArena, name: &str, invars: &[&str], outvars: &[&str]) -> Stage {
        let inner: Vec<Var> = invars.iter().map(|n| v(&format!("{name}.{n}"))).collect();
        let start = arena.push(Eqn {
            kind: EqnKind::StageStart {
                name: name.into(),
                mesh: None,
            },
            invars: invars.iter().map(|n| v(n)).collect(),
            outvars: inner,
        });
        let end = arena.push(Eqn {
            kind: EqnKind::StageEnd { name: name.into() },
            invars: outvars.iter().map(|n| v(&format!("{name}.{n}"))).collect(),
            outvars: outvars.iter().map(|n| v(n)).collect(),
        });
        Stage::from_eqns(arena, vec![start, end]).unwrap()
    }

    /// Four stages mirrored onto two meshes, plus one apply stage per mesh.
    fn pipeline() -> (Vec<Var>, Vec<Stage>, Vec<Vec<usize>>) {
        let mut arena = EqnArena::new();
        let stages = vec![
            stage(&mut arena, "f0", &["x", "w0"], &["h0"]),
            stage(&mut arena, "f1", &["h0", "w1"], &["h1"]),
            stage(&mut arena, "b1", &["h1", "h0", "w1", "acc1"], &["d1", "acc1_out"]),
            stage(&mut arena, "b0", &["d1", "x", "w0", "acc0"], &["acc0_out"]),
            stage(&mut arena, "apply_grad_0", &["w0", "acc0_out"], &["w0_new"]),
            stage(&mut arena, "apply_grad_1", &["w1", "acc1_out"], &["w1_new"]),
        ];
        let globals = vec![v("x"), v("w0"), v("w1"), v("acc0"), v("acc1")];
        (globals, stages, vec![vec![0, 3, 4], vec![1, 2, 5]])
    }

    #[test]
    fn expected_flags() {
        let (globals, stages, pattern) = pipeline();
        let flags =
            split_donate_invars(&[false, false, false, true, true], &globals, &stages, &pattern)
                .unwrap();

        // b1 reads h0 again later on mesh 1, so f1 must keep it.
        assert_eq!(flags[1], vec![false, false]);
        // The copy of h0 on mesh 1 dies with b1, and so does h1.
        assert_eq!(flags[2], vec![true, true, false, true]);
        assert_eq!(flags[3], vec![true, false, false, true]);
        assert_eq!(flags[4], vec![false, true]);
        assert_eq!(flags[5], vec![false, true]);
    }

    #[test]
    fn non_donated_globals_are_never_donated() {
        let (globals, stages, pattern) = pipeline();
        for mask in 0u32..32 {
            let donated: Vec<bool> = (0..5).map(|i| mask & (1 << i) != 0).collect();
            let flags = split_donate_invars(&donated, &globals, &stages, &pattern).unwrap();
            for (stage, stage_flags) in stages.iter().zip(&flags) {
                for (var, flag) in stage.invars.iter().zip(stage_flags) {
                    if let Some(i) = globals.iter().position(|g| g == var) {
                        assert!(!*flag || donated[i], "{var} donated against caller");
                    }
                }
            }
        }
    }

    #[test]
    fn last_donation_follows_every_reader() {
        let (globals, stages, pattern) = pipeline();
        let flags =
            split_donate_invars(&[true; 5], &globals, &stages, &pattern).unwrap();

        let mut readers: HashMap<&Var, Vec<usize>> = HashMap::new();
        let mut last_donation: HashMap<&Var, usize> = HashMap::new();
        for (idx, stage) in stages.iter().enumerate() {
            for (var, flag) in stage.invars.iter().zip(&flags[idx]) {
                readers.entry(var).or_default().push(idx);
                if *flag {
                    last_donation.insert(var, idx);
                }
            }
        }
        for (var, at) in last_donation {
            let others = &readers[var];
            assert!(others.iter().all(|r| *r <= at), "{var} donated at {at} but read at {others:?}");
        }
    }

    #[test]
    fn main_copy_survives_for_a_later_reader_on_another_mesh() {
        let mut arena = EqnArena::new();
        let stages = vec![
            stage(&mut arena, "f0", &["x"], &["h0"]),
            stage(&mut arena, "f1", &["h0"], &["h1"]),
            stage(&mut arena, "b1", &["h1"], &["d1"]),
            stage(&mut arena, "b0", &["d1", "h1"], &["g"]),
        ];
        let globals = vec![v("x")];
        let pattern = vec![vec![0, 3], vec![1, 2]];
        let flags = split_donate_invars(&[true], &globals, &stages, &pattern).unwrap();

        // h1 lives on mesh 1 and is dead there after b1, but b0 on mesh 0
        // still copies it later.
        assert_eq!(flags[2], vec![false]);
        // Mesh 0 only holds copies of d1 and h1.
        assert_eq!(flags[3], vec![true, true]);
        assert_eq!(flags[1], vec![true]);
    }

    #[test]
    fn repeated_input_is_donated_only_at_its_last_read() {
        let mut arena = EqnArena::new();
        let stages = vec![
            stage(&mut arena, "f", &["x"], &["h"]),
            stage(&mut arena, "b", &["h", "h"], &["z"]),
        ];
        let globals = vec![v("x")];
        let flags =
            split_donate_invars(&[true], &globals, &stages, &[vec![0, 1]]).unwrap();
        assert_eq!(flags[1], vec![false, true]);
    }

    #[test]
    fn mismatched_inputs_fail() {
        let (globals, stages, pattern) = pipeline();
        assert!(split_donate_invars(&[true], &globals, &stages, &pattern).is_err());
        assert!(split_donate_invars(&[true; 5], &globals, &stages, &[vec![0, 1, 2]]).is_err());
        let overlapping = vec![vec![0, 1, 2, 3, 4, 5], vec![5]];
        assert!(split_donate_invars(&[true; 5], &globals, &stages, &overlapping).is_err());
    }
}
