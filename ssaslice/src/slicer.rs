//! Backward dependency slicing over define-site links.
//!
//! A slice of a root assignment is the set of assignments it transitively depends upon. It is
//! emitted root first, with every assignment appearing before the assignments it depends upon
//! (reverse topological order); [`execution_order`] flips it around into an order in which every
//! definition precedes its uses.

use crate::analysis_config::CONFIG;
use crate::arch::Architecture;
use crate::builder::build_assignment;
use crate::containers::unordered::UnorderedSet;
use crate::error::{Error, Result};
use crate::expr::{Assignment, VersionedRegister};
use crate::il::{Function, InstructionKind, Program};
use crate::log::*;

/// The full-register identities of every register that `assignment` reads, in left-to-right order,
/// without duplicates.
///
/// Sub-registers resolve to their owning full register. A write to a sub-register also reads the
/// previous version of its full register (subject to
/// [`track_previous_version_of_partial_writes`](crate::analysis_config::AnalysisConfig)).
pub fn referenced_registers(assignment: &Assignment, arch: &Architecture) -> Vec<VersionedRegister> {
    let mut seen: UnorderedSet<VersionedRegister> = Default::default();
    let mut res = vec![];
    for e in assignment.expressions() {
        for r in e.registers() {
            let r = r.to_full(arch);
            if seen.insert(r.clone()) {
                res.push(r);
            }
        }
    }
    if let Assignment::PartialRegister { full, .. } = assignment {
        if CONFIG.track_previous_version_of_partial_writes {
            if let Some(prev) = full.previous() {
                if seen.insert(prev.clone()) {
                    res.push(prev);
                }
            }
        }
    }
    res
}

enum Frame {
    /// Expand the dependencies of this assignment
    Enter(Assignment),
    /// All dependencies of this assignment have been emitted
    Exit(Assignment),
}

/// Compute the backward slice of `root`.
///
/// `define_site_of` looks up the assignment defining a (full) register, returning `Ok(None)` for
/// free inputs to the function. Each destination is expanded exactly once, no matter how many
/// paths reach it. Reaching a register that is still being expanded means the define-site links
/// form a cycle, which is reported as [`Error::CyclicDependency`].
pub fn slice(
    root: Assignment,
    arch: &Architecture,
    mut define_site_of: impl FnMut(&VersionedRegister) -> Result<Option<Assignment>>,
) -> Result<Vec<Assignment>> {
    let mut done: UnorderedSet<VersionedRegister> = Default::default();
    let mut in_progress: UnorderedSet<VersionedRegister> = Default::default();
    let mut postorder: Vec<Assignment> = vec![];
    let mut stack: Vec<Frame> = vec![Frame::Enter(root)];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(assignment) => {
                if let Some(dest) = assignment.defined_register() {
                    if done.contains(dest) {
                        continue;
                    }
                    if in_progress.contains(dest) {
                        return Err(Error::CyclicDependency {
                            register: dest.clone(),
                            assignment: assignment.to_string(),
                        });
                    }
                    in_progress.insert(dest.clone());
                }
                if CONFIG.debug_log_slice_traversal {
                    trace!("Expanding"; "assignment" => %assignment);
                }
                let deps = referenced_registers(&assignment, arch);
                stack.push(Frame::Exit(assignment));
                // Reversed, so that dependencies are expanded left to right
                for r in deps.into_iter().rev() {
                    if done.contains(&r) {
                        continue;
                    }
                    if in_progress.contains(&r) {
                        return Err(Error::CyclicDependency {
                            assignment: format!("reference to {}", r),
                            register: r,
                        });
                    }
                    match define_site_of(&r)? {
                        Some(def) => stack.push(Frame::Enter(def)),
                        None => {
                            if CONFIG.debug_log_slice_traversal {
                                trace!("Free input"; "register" => %r);
                            }
                        }
                    }
                }
            }
            Frame::Exit(assignment) => {
                if let Some(dest) = assignment.defined_register() {
                    if done.contains(dest) {
                        continue;
                    }
                    in_progress.remove(dest);
                    done.insert(dest.clone());
                }
                postorder.push(assignment);
            }
        }
    }

    postorder.reverse();
    debug!("Computed slice"; "len" => postorder.len());
    Ok(postorder)
}

/// Reorder a slice so that every definition precedes its uses.
pub fn execution_order(slice: &[Assignment]) -> Vec<Assignment> {
    slice.iter().rev().cloned().collect()
}

/// A define-site lookup over the instructions of `function`.
fn define_site_in<'a>(
    function: &'a Function,
) -> impl FnMut(&VersionedRegister) -> Result<Option<Assignment>> + 'a {
    move |r: &VersionedRegister| {
        function
            .define_site_of(&r.to_ssa())
            .map(|insn| build_assignment(insn, function.arch))
            .transpose()
    }
}

/// Slice starting from the IL instruction lifted from the machine instruction at `address`.
pub fn slice_from_address(program: &Program, address: u64) -> Result<Vec<Assignment>> {
    let function = program
        .function_containing(address)
        .ok_or(Error::NoFunctionContaining(address))?;
    let insn = function
        .instruction_at(address)
        .ok_or(Error::NoInstructionAt(address))?;
    debug!("Slicing from address"; "address" => format!("{:#x}", address), "function" => &function.name);
    let root = build_assignment(insn, function.arch)?;
    slice(root, function.arch, define_site_in(function))
}

/// Slice starting from the latest SSA version of register `name` in `function`.
///
/// A register that is never mentioned, or only ever read (i.e., never defined), has nothing to
/// slice, which results in an empty slice rather than an error.
pub fn slice_from_register_name(function: &Function, name: &str) -> Result<Vec<Assignment>> {
    let latest = match function.all_versions_of(name).pop() {
        Some(r) => r,
        None => {
            info!("Register not mentioned in function"; "register" => name, "function" => &function.name);
            return Ok(vec![]);
        }
    };
    let insn = match function.define_site_of(&latest) {
        Some(insn) => insn,
        None => {
            info!("Register not defined in function"; "register" => %latest, "function" => &function.name);
            return Ok(vec![]);
        }
    };
    debug!("Slicing from register"; "register" => %latest, "function" => &function.name);
    let root = build_assignment(insn, function.arch)?;
    slice(root, function.arch, define_site_in(function))
}

/// One slice per memory store in `function`, in program order.
pub fn slice_all_memory_writes(function: &Function) -> Result<Vec<Vec<Assignment>>> {
    function
        .instructions()
        .iter()
        .filter(|insn| matches!(insn.kind, InstructionKind::Store { .. }))
        .map(|insn| {
            debug!("Slicing memory write"; "address" => format!("{:#x}", insn.address));
            let root = build_assignment(insn, function.arch)?;
            slice(root, function.arch, define_site_in(function))
        })
        .collect()
}
