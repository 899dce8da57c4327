//! Lowering of heterogeneous segments into worker blocks and the trainer-side
//! remote calls that replace them.

pub mod adapters;
mod heter;
mod trainer;

use std::collections::BTreeMap;

use crate::dataflow::is_placeholder;
use crate::ir::{OpId, Operator, Program};

pub use adapters::{CommInfo, JointLayout, JointSlot};
pub use heter::{lower_heter_program, STEP_COUNTER};
pub use trainer::{
    assemble_trainer_program, remove_trainer_sends, replace_segment, TrainerAssembly,
};

/// `send` operators of the global block keyed by every variable they send.
pub(crate) fn send_ops_by_input(program: &Program) -> BTreeMap<String, OpId> {
    let mut sends = BTreeMap::new();
    for op in &program.global_block().ops {
        if op.op_type != "send" {
            continue;
        }
        for name in op.input_arg_names().filter(|name| !is_placeholder(name)) {
            sends.insert(name.to_string(), op.id);
        }
    }
    sends
}

/// Copies the declarations of every variable `op` references from `source` into
/// `target`. Names `source` does not declare are skipped.
pub(crate) fn clone_op_vars(target: &mut Program, source: &Program, op: &Operator) {
    for name in op.input_arg_names().chain(op.output_arg_names()) {
        if let Some(var) = source.var(name) {
            target.clone_variable(var);
        }
    }
}
