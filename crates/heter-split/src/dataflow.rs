//! Variable-level dataflow over partitioned segments.
//!
//! Every segment gets a [`BlockVarDetail`] describing which variables it needs
//! from its predecessor (`entrance`), which it hands to its successor (`exit`),
//! which never leave it (`private`) and which persistable names it touches.
//! Boundary repair then makes adjacent segments agree on what crosses between
//! them.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::error::{Result, RewriteError};
use crate::ir::{Device, IrError, OpId, Operator, Program, EMPTY_VAR_NAME, GRAD_SUFFIX};
use crate::partition::{PartitionPlan, Segment};

const QUEUE_MARKER: &str = "lod_tensor_blocking_queue";

/// Per-segment variable classification. Sets iterate in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockVarDetail {
    pub entrance: BTreeSet<String>,
    pub exit: BTreeSet<String>,
    pub private: BTreeSet<String>,
    pub persistables: BTreeSet<String>,
}

impl BlockVarDetail {
    /// Whether the segment reads, writes or owns `name` in any role.
    pub fn holds(&self, name: &str) -> bool {
        self.private.contains(name) || self.exit.contains(name) || self.entrance.contains(name)
    }

    /// Persistable gradients (`name@GRAD`) referenced by the segment.
    pub fn persistable_grads(&self) -> impl Iterator<Item = &str> {
        self.persistables
            .iter()
            .map(String::as_str)
            .filter(|name| is_grad_name(name))
    }
}

/// Names that never denote an addressable variable.
pub fn is_placeholder(name: &str) -> bool {
    name == EMPTY_VAR_NAME || name.contains(QUEUE_MARKER)
}

/// Strips a trailing `@GRAD` suffix, if any.
pub fn base_name(name: &str) -> &str {
    name.split(GRAD_SUFFIX).next().unwrap_or(name)
}

pub fn is_grad_name(name: &str) -> bool {
    name.ends_with(GRAD_SUFFIX)
}

/// A name is persistable when its base name is declared persistable, looked up
/// in `origin` first and in `program` as a fallback.
pub fn is_persistable_name(name: &str, origin: &Program, program: &Program) -> bool {
    let base = base_name(name);
    origin
        .var(base)
        .or_else(|| program.var(base))
        .is_some_and(|var| var.is_persistable())
}

pub fn op_input_output(op: &Operator) -> (BTreeSet<String>, BTreeSet<String>) {
    let inputs = op
        .input_arg_names()
        .filter(|name| !is_placeholder(name))
        .map(str::to_string)
        .collect();
    let outputs = op
        .output_arg_names()
        .filter(|name| !is_placeholder(name))
        .map(str::to_string)
        .collect();
    (inputs, outputs)
}

/// Unions the input and output names of `ops`.
pub fn compute_input_output<'a>(
    ops: impl IntoIterator<Item = &'a Operator>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut inputs = BTreeSet::new();
    let mut outputs = BTreeSet::new();
    for op in ops {
        let (op_in, op_out) = op_input_output(op);
        inputs.extend(op_in);
        outputs.extend(op_out);
    }
    (inputs, outputs)
}

/// Classifies the variables of every segment of the global block of `program`.
pub fn classify(
    program: &Program,
    origin: &Program,
    segments: &[Segment],
) -> Result<Vec<BlockVarDetail>> {
    let by_id: HashMap<OpId, &Operator> = program
        .global_block()
        .ops
        .iter()
        .map(|op| (op.id, op))
        .collect();

    let mut details = Vec::with_capacity(segments.len());
    for segment in segments {
        let mut ops = Vec::with_capacity(segment.ops.len());
        for id in &segment.ops {
            let op = by_id.get(id).ok_or(IrError::UnknownOperator(*id))?;
            ops.push(*op);
        }
        let (mut inputs, mut outputs) = compute_input_output(ops);

        let mut persistables = BTreeSet::new();
        for name in inputs.iter().chain(outputs.iter()) {
            if is_persistable_name(name, origin, program) {
                persistables.insert(name.clone());
            }
        }
        inputs.retain(|name| !persistables.contains(name));
        outputs.retain(|name| !persistables.contains(name));

        let private: BTreeSet<String> = inputs.intersection(&outputs).cloned().collect();
        let entrance = inputs.difference(&private).cloned().collect();
        let exit = outputs.difference(&private).cloned().collect();
        details.push(BlockVarDetail {
            entrance,
            exit,
            private,
            persistables,
        });
    }
    Ok(details)
}

/// Makes every segment's entrance available from its predecessor.
///
/// Segments are visited last to first. Each step reads the previous version
/// and produces a new one, so earlier decisions never observe partial edits.
/// `devices[i]` is the device of segment `i`; `declared` tells whether a name
/// is a declared program variable (a feed) rather than a dangling read.
pub fn repair_boundaries(
    details: &[BlockVarDetail],
    devices: &[Device],
    default_device: &Device,
    declared: impl Fn(&str) -> bool,
) -> Result<Vec<BlockVarDetail>> {
    let mut current = details.to_vec();
    for i in (1..current.len()).rev() {
        let snapshot = &current;
        let mut next = snapshot.clone();
        let on_default = |idx: usize| devices.get(idx) == Some(default_device);

        let missing: Vec<&String> = snapshot[i]
            .entrance
            .difference(&snapshot[i - 1].exit)
            .collect();
        for var in missing {
            let holders: Vec<usize> = (0..i).rev().filter(|&j| snapshot[j].holds(var)).collect();
            if on_default(i) && holders.iter().any(|&j| on_default(j)) {
                debug!(segment = i, var = %var, "boundary var satisfied locally");
                next[i].entrance.remove(var);
                continue;
            }
            if holders.is_empty() && !declared(var) {
                return Err(RewriteError::UnresolvedBoundaryVar {
                    segment: i,
                    var: var.clone(),
                });
            }
            let prev = &mut next[i - 1];
            if !snapshot[i - 1].holds(var) {
                prev.entrance.insert(var.clone());
            }
            prev.private.remove(var);
            prev.exit.insert(var.clone());
        }
        current = next;
    }
    Ok(current)
}

/// Drops exits that the following segment never reads. The last segment's
/// exit is left as is.
pub fn prune_dead_exits(details: &mut [BlockVarDetail]) {
    for i in 0..details.len().saturating_sub(1) {
        let (head, tail) = details.split_at_mut(i + 1);
        let next_entrance = &tail[0].entrance;
        head[i].exit.retain(|var| next_entrance.contains(var));
    }
}

/// `classify`, then `repair_boundaries`, then `prune_dead_exits`.
pub fn find_block_joints(
    program: &Program,
    origin: &Program,
    plan: &PartitionPlan,
) -> Result<Vec<BlockVarDetail>> {
    let details = classify(program, origin, &plan.segments)?;
    let devices = plan.segment_devices();
    let mut repaired = repair_boundaries(&details, &devices, &plan.default_device, |name| {
        program.has_var(name) || origin.has_var(name)
    })?;
    prune_dead_exits(&mut repaired);
    Ok(repaired)
}
