use crate::error::Result;
use crate::ir::Program;
use crate::lowering::assemble_trainer_program;
use crate::passes::{PassContext, PassResult, ProgramPass};

/// Replaces heterogeneous segments of the trainer with remote calls and moves
/// every remaining operator back to the default device.
#[derive(Default)]
pub struct AssembleTrainerPass;

impl AssembleTrainerPass {
    const NAME: &'static str = "assemble_trainer";
}

impl ProgramPass for AssembleTrainerPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &mut Program, cx: &mut PassContext<'_>) -> Result<PassResult> {
        let default_device = &cx.config.default_device;
        let Some(plan) = cx.plan.as_ref() else {
            program.force_device(0, default_device)?;
            return Ok(PassResult::default());
        };
        let assembly = assemble_trainer_program(
            program,
            &mut *cx.strategy,
            plan,
            &cx.block_var_detail,
            default_device,
        )?;
        Ok(PassResult::from_counts(
            assembly.inserted_ops,
            assembly.erased_ops,
            assembly.erased_vars,
        ))
    }
}
