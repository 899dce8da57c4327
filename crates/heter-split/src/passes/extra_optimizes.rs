use std::collections::HashSet;

use tracing::debug;

use crate::error::Result;
use crate::ir::{OpId, Program};
use crate::passes::{
    is_optimize_op, optimizer_state_vars, remove_unreferenced, PassContext, PassResult,
    ProgramPass,
};

/// Drops initializers and declarations of optimizer state from the startup
/// program; the state lives on the parameter servers.
#[derive(Default)]
pub struct DeleteExtraOptimizesPass;

impl DeleteExtraOptimizesPass {
    const NAME: &'static str = "delete_extra_optimizes";
}

impl ProgramPass for DeleteExtraOptimizesPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program, cx: &mut PassContext<'_>) -> Result<PassResult> {
        let origin = cx.strategy().origin_main_program();
        let state_vars = optimizer_state_vars(
            origin
                .global_block()
                .ops
                .iter()
                .filter(|op| is_optimize_op(op)),
        );

        let initializers: HashSet<OpId> = program
            .global_block()
            .ops
            .iter()
            .filter(|op| state_vars.iter().any(|var| op.writes(var)))
            .map(|op| op.id)
            .collect();
        let erased_ops = program.remove_ops_by_id(0, &initializers)?;
        let erased_vars = remove_unreferenced(program, state_vars)?;
        debug!(erased_ops, erased_vars, "deleted optimizer state from startup");
        Ok(PassResult::from_counts(0, erased_ops, erased_vars))
    }
}
