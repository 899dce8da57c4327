use std::collections::HashSet;

use tracing::debug;

use crate::error::Result;
use crate::ir::{OpId, OpRole, Program, OP_ROLE};
use crate::passes::{
    is_clip_op, is_lr_sched_op, is_optimize_op, optimizer_state_vars, remove_unreferenced,
    PassContext, PassResult, ProgramPass,
};

/// Strips optimizer and learning-rate scheduling operators from the trainer;
/// parameter updates run on the parameter servers.
#[derive(Default)]
pub struct DeleteOptimizerPass;

impl DeleteOptimizerPass {
    const NAME: &'static str = "delete_optimizer";
}

impl ProgramPass for DeleteOptimizerPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program, _cx: &mut PassContext<'_>) -> Result<PassResult> {
        let block = program.global_block_mut();
        let mut retagged = 0;
        for op in &mut block.ops {
            if op.role() == Some(OpRole::OPTIMIZE) && is_clip_op(op) {
                op.set_attr(OP_ROLE, OpRole::BACKWARD);
                retagged += 1;
            }
        }

        let doomed: Vec<_> = block
            .ops
            .iter()
            .filter(|op| is_optimize_op(op) || is_lr_sched_op(op))
            .collect();
        let state_vars = optimizer_state_vars(doomed.iter().copied());
        let ids: HashSet<OpId> = doomed.iter().map(|op| op.id).collect();

        let erased_ops = program.remove_ops_by_id(0, &ids)?;
        let erased_vars = remove_unreferenced(program, state_vars)?;
        debug!(erased_ops, erased_vars, retagged, "deleted optimizer subgraph");

        let mut result = PassResult::from_counts(0, erased_ops, erased_vars);
        result.changed |= retagged > 0;
        Ok(result)
    }
}
